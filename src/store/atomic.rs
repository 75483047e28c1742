use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Write-temp, fsync, rename. A crash leaves either the old file or the new one.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let tmp = sibling(path, ".tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// `write_json_atomic` under a per-attempt timeout, retried with exponential backoff.
/// Returns how many retries were needed.
pub async fn persist_with_retry<T: Serialize + ?Sized>(path: &Path, value: &T, policy: &StoreConfig) -> Result<u32, StoreError> {
    let attempts = policy.max_retries + 1;
    let mut last = String::new();
    for attempt in 0..attempts {
        let result = match tokio::time::timeout(policy.io_timeout(), write_json_atomic(path, value)).await {
            Ok(r) => r,
            Err(_) => Err(StoreError::Timeout(policy.io_timeout())),
        };
        match result {
            Ok(()) => return Ok(attempt),
            // Serialization will not get better on retry.
            Err(e @ StoreError::Serialize(_)) => return Err(e),
            Err(e) => {
                warn!("write of {} failed (attempt {}/{}): {}", path.display(), attempt + 1, attempts, e);
                last = e.to_string();
                if attempt + 1 < attempts {
                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
            }
        }
    }
    Err(StoreError::Exhausted { attempts, last })
}

/// What a tolerant read got back.
#[derive(Debug)]
pub enum Recovered<T> {
    Loaded(T),
    /// Nothing usable at the path, and nothing there worth keeping: free to write.
    Empty,
    /// Unusable, and it could not be moved aside. Writing the path would destroy it.
    Held,
}

impl<T> Recovered<T> {
    pub fn value(self) -> Option<T> {
        match self {
            Recovered::Loaded(value) => Some(value),
            Recovered::Empty | Recovered::Held => None,
        }
    }

    pub fn is_held(&self) -> bool {
        matches!(self, Recovered::Held)
    }
}

/// Renames an unusable file out of the way so the next write cannot destroy it.
async fn set_aside<T>(path: &Path, suffix: &str, what: &str) -> Recovered<T> {
    let aside = sibling(path, suffix);
    match tokio::fs::rename(path, &aside).await {
        Ok(()) => {
            warn!("{} moved aside to {}", what, aside.display());
            Recovered::Empty
        }
        Err(e) => {
            error!("could not move {} aside ({}); it will not be overwritten", what, e);
            Recovered::Held
        }
    }
}

/// Reads a JSON file, treating absence as empty and corruption as empty plus a loud warning.
/// Corrupt or unreadable files are moved aside so the evidence survives the next write;
/// one that cannot be moved comes back as `Held`.
pub async fn read_json_tolerant<T: DeserializeOwned>(path: &Path, what: &str) -> Recovered<T> {
    let content = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        // A file where the directory should be means nothing can exist at the path.
        Err(e) if matches!(e.kind(), std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory) => {
            debug!("no {} at {}, starting empty", what, path.display());
            return Recovered::Empty;
        }
        Err(e) => {
            warn!("UNREADABLE {} at {}: {}; starting empty", what, path.display(), e);
            return set_aside(path, ".unreadable", what).await;
        }
    };
    match serde_json::from_slice(&content) {
        Ok(value) => Recovered::Loaded(value),
        Err(e) => {
            warn!("CORRUPT {} at {}: {}; starting empty", what, path.display(), e);
            set_aside(path, ".corrupt", what).await
        }
    }
}
