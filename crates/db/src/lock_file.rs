use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use concord_core::audit::{ActModeLockStore, SinkError};
use concord_core::domain::resource::ActModeLock;
use tracing::{info, warn};

/// Act-mode lock persisted as a single JSON document. The file's presence
/// means an audit is pending.
#[derive(Clone, Debug)]
pub struct FileLockStore {
    path: PathBuf,
}

impl FileLockStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the lock after an audit. Returns `false` when no lock was present.
    pub async fn clear(&self) -> Result<bool, SinkError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(
                    event_name = "storage.lock.cleared",
                    path = %self.path.display(),
                    "act-mode lock cleared"
                );
                Ok(true)
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => {
                Err(SinkError::Write(format!("remove `{}`: {error}", self.path.display())))
            }
        }
    }
}

#[async_trait]
impl ActModeLockStore for FileLockStore {
    async fn write_lock(&self, lock: &ActModeLock) -> Result<(), SinkError> {
        let body = serde_json::to_vec_pretty(lock)
            .map_err(|error| SinkError::Write(format!("encode act-mode lock: {error}")))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|error| {
                SinkError::Write(format!("create `{}`: {error}", parent.display()))
            })?;
        }

        let staging = self.path.with_extension("lock.tmp");
        tokio::fs::write(&staging, body)
            .await
            .map_err(|error| SinkError::Write(format!("write `{}`: {error}", staging.display())))?;
        tokio::fs::rename(&staging, &self.path).await.map_err(|error| {
            SinkError::Write(format!("replace `{}`: {error}", self.path.display()))
        })?;

        info!(
            event_name = "storage.lock.written",
            path = %self.path.display(),
            reason = %lock.reason,
            "act-mode lock written"
        );
        Ok(())
    }

    async fn read_lock(&self) -> Result<Option<ActModeLock>, SinkError> {
        let body = match tokio::fs::read(&self.path).await {
            Ok(body) => body,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(SinkError::Read(format!("read `{}`: {error}", self.path.display())))
            }
        };

        match serde_json::from_slice(&body) {
            Ok(lock) => Ok(Some(lock)),
            Err(error) => {
                warn!(
                    event_name = "storage.lock.unparseable",
                    path = %self.path.display(),
                    error = %error,
                    "act-mode lock file is not valid JSON"
                );
                Err(SinkError::Read(format!("decode `{}`: {error}", self.path.display())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use concord_core::audit::{ActModeLockStore, SinkError};
    use concord_core::domain::resource::ActModeLock;

    use super::FileLockStore;

    #[tokio::test]
    async fn missing_file_means_unlocked() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = FileLockStore::new(dir.path().join("act_mode.lock"));

        assert_eq!(store.read_lock().await.expect("read"), None);
        assert!(!store.clear().await.expect("clear"));
    }

    #[tokio::test]
    async fn written_lock_is_read_back_and_can_be_cleared() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = FileLockStore::new(dir.path().join("nested").join("act_mode.lock"));
        let lock = ActModeLock {
            timestamp: Utc::now(),
            reason: "Emergency shutdown - audit required".to_string(),
        };

        store.write_lock(&lock).await.expect("write");
        assert_eq!(store.read_lock().await.expect("read"), Some(lock));

        let raw = std::fs::read_to_string(store.path()).expect("raw file");
        assert!(raw.contains("\"reason\""));
        assert!(raw.contains("\"timestamp\""));

        assert!(store.clear().await.expect("clear"));
        assert_eq!(store.read_lock().await.expect("read"), None);
    }

    #[tokio::test]
    async fn garbage_lock_file_is_a_read_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("act_mode.lock");
        std::fs::write(&path, "locked!").expect("write garbage");

        let store = FileLockStore::new(path);
        assert!(matches!(store.read_lock().await, Err(SinkError::Read(_))));
    }
}
