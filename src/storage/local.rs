use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info, warn};

use super::{StorageBackend, StorageError, StorageResult, remove_each, validate_segment};

/// Filesystem store served over HTTP by an external web server.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    object_path: PathBuf,
    base_url: String,
}

impl LocalStorage {
    /// Create the object directory if needed.
    pub async fn connect(object_path: PathBuf, host: &str, port: u16) -> StorageResult<Self> {
        fs::create_dir_all(&object_path).await?;
        Ok(Self {
            object_path,
            base_url: format!("{}:{}", host.trim_end_matches('/'), port),
        })
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn upload(&self, namespace: &str, path: &str, data: Vec<u8>) -> StorageResult<String> {
        validate_segment("namespace", namespace)?;
        validate_segment("path", path)?;

        let full_path = self.object_path.join(namespace).join(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&full_path, data).await?;
        debug!(path = %full_path.display(), "stored artifact");

        Ok(format!("{}/{}/{}", self.base_url, namespace, path))
    }

    async fn remove_older_than(&self, age: Duration) -> StorageResult<Vec<String>> {
        let now = SystemTime::now();
        let mut expired = Vec::new();
        let mut entries = fs::read_dir(&self.object_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let modified = match entry.metadata().await.and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(err) => {
                    warn!(namespace = %name, error = %err, "cannot read namespace age; skipping");
                    continue;
                }
            };
            // Future mtimes count as fresh.
            let elapsed = now.duration_since(modified).unwrap_or_default();
            if elapsed > age {
                info!(namespace = %name, age_secs = elapsed.as_secs(), "removing expired namespace");
                expired.push(name);
            }
        }
        expired.sort();

        Ok(remove_each(expired, |name| {
            let path = self.object_path.join(name);
            async move {
                if fs::symlink_metadata(&path).await?.is_dir() {
                    fs::remove_dir_all(&path).await?;
                } else {
                    fs::remove_file(&path).await?;
                }
                Ok::<(), StorageError>(())
            }
        })
        .await)
    }
}
