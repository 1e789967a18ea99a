//! Simple example of using proxy-media-pipeline.
//!
//! Builds a session-templated pool, sends one request through the proxy
//! middleware, then records a listing's media in deferred mode.

use proxy_media_pipeline::{
    MediaPipeline, MediaReference, MediaType, PipelineConfig, Protocol, ProxyPool, ProxyPoolConfig,
    ProxyPoolMiddleware, SourceConfig,
};
use reqwest_middleware::ClientBuilder;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Initializing proxy pool...");

    let source = SourceConfig::SessionTemplated {
        account: std::env::var("PROXY_ACCOUNT").unwrap_or_else(|_| "demo".into()),
        password: std::env::var("PROXY_PASSWORD").unwrap_or_else(|_| "demo".into()),
        region: "us".into(),
        gateway_host: "gate.example.net".into(),
        gateway_port: 7000,
        protocol: Protocol::Http,
        ttl_minutes: 10,
        batch_size: 5,
        session_len: 8,
    };
    let config = ProxyPoolConfig::builder(source)
        .max_fails(3)
        .min_proxy_count(3)
        .snapshot_path(std::env::temp_dir().join("proxy-pool-snapshot.json"))
        .build();

    let pool = ProxyPool::new(config).await?;
    println!("Pool stats: {:?}", pool.stats());

    let client = ClientBuilder::new(reqwest::Client::new())
        .with(ProxyPoolMiddleware::new(pool.clone()).timeout(Duration::from_secs(10)))
        .build();

    println!("Sending request...");
    match client.get("https://httpbin.org/ip").send().await {
        Ok(response) => println!("Status: {}", response.status()),
        Err(e) => println!("Request failed: {}", e),
    }

    // Deferred mode only records the references; nothing is downloaded.
    let pipeline = MediaPipeline::builder(pool.clone(), PipelineConfig::builder().deferred(true).build()).build()?;
    let references = vec![
        MediaReference::image("https://img.example.com/listing/42/front.jpg", "42", 0),
        MediaReference::image("https://img.example.com/listing/42/kitchen.jpg", "42", 1),
        MediaReference::new(MediaType::Video, "https://img.example.com/listing/42/tour.mp4", "42", 2),
    ];
    for outcome in pipeline.process("42", references).await {
        println!("{} #{} -> {:?}", outcome.original_url, outcome.position, outcome.status);
    }

    println!("Pool stats: {:?}", pool.stats());
    Ok(())
}
