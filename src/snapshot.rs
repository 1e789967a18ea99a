//! JSON snapshot of a dynamic pool, so rented capacity survives restarts.

use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::PoolType;
use crate::error::PersistenceError;
use crate::proxy::Proxy;

/// On-disk pool snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub proxies: Vec<Proxy>,
    pub last_update: DateTime<Utc>,
    pub pool_type: PoolType,
}

impl PoolSnapshot {
    /// Drop entries that are already dead: over `max_fails`, or past
    /// the end of their lease for rented and session pools. Returns how
    /// many were dropped.
    pub fn retain_live(&mut self, max_fails: u32, now: DateTime<Utc>) -> usize {
        let before = self.proxies.len();
        let leased = self.pool_type.has_leases();
        self.proxies
            .retain(|p| p.is_selectable(max_fails) && !(leased && p.is_expired(now)));
        before - self.proxies.len()
    }
}

/// Reads and writes the snapshot file. Writes go to a sibling temporary
/// file that is renamed into place; a write carrying an older revision
/// than one already on disk is skipped.
#[derive(Debug)]
pub struct SnapshotStore {
    path: PathBuf,
    written: Mutex<Option<u64>>,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot, `Ok(None)` when no file exists yet.
    pub fn load(&self) -> Result<Option<PoolSnapshot>, PersistenceError> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|source| PersistenceError::Format {
                path: self.path.clone(),
                source,
            })
    }

    /// Write `snapshot` taken at `revision`. Returns `false` when a newer
    /// revision was already written.
    pub fn save(&self, revision: u64, snapshot: &PoolSnapshot) -> Result<bool, PersistenceError> {
        let mut written = self.written.lock();
        if let Some(have) = *written {
            if revision <= have {
                debug!("Skipping stale snapshot revision {} (have {})", revision, have);
                return Ok(false);
            }
        }

        let io_err = |source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(snapshot).map_err(|source| PersistenceError::Format {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;

        *written = Some(revision);
        Ok(true)
    }
}
