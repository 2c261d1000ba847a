//! Artifact storage backends.
//!
//! Artifacts are grouped into namespaces, one per job uuid. Retention works on
//! whole namespaces: a backend removes every namespace older than a given age
//! and reports which ones it removed so the matching rows can be deleted.

mod local;
mod swift;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::error;

use crate::config::StorageConfig;

pub use local::LocalStorage;
pub use swift::SwiftStorage;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid object path: {0}")]
    InvalidPath(String),
    #[error("swift authentication failed: {0}")]
    Auth(String),
    #[error("storage request to {url} failed with status {status}")]
    Status { url: String, status: u16 },
    #[error("invalid timestamp {value:?} on namespace {namespace}")]
    Timestamp { namespace: String, value: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Upload and retention contract shared by every artifact store.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store `data` as `path` inside `namespace`, returning a retrievable url.
    async fn upload(&self, namespace: &str, path: &str, data: Vec<u8>) -> StorageResult<String>;

    /// Delete every namespace last modified more than `age` ago.
    ///
    /// Returns the removed namespace names.
    async fn remove_older_than(&self, age: Duration) -> StorageResult<Vec<String>>;
}

impl StorageConfig {
    /// Build the configured backend.
    pub async fn connect(&self) -> StorageResult<Arc<dyn StorageBackend>> {
        match self {
            StorageConfig::Local {
                object_path,
                host,
                port,
            } => {
                let storage = LocalStorage::connect(object_path.clone(), host, *port).await?;
                Ok(Arc::new(storage))
            }
            StorageConfig::Swift(swift) => {
                let storage = SwiftStorage::connect(swift.clone()).await?;
                Ok(Arc::new(storage))
            }
        }
    }
}

/// Reject names that could escape their namespace.
pub(crate) fn validate_segment(kind: &str, value: &str) -> StorageResult<()> {
    let bad = value.is_empty()
        || value.starts_with('/')
        || value.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(StorageError::InvalidPath(format!("{kind} {value:?}")));
    }
    Ok(())
}

/// Remove each expired namespace in turn.
///
/// A failed removal is logged and skipped; the names removed so far are
/// still returned so their rows get deleted.
pub(crate) async fn remove_each<F, Fut>(expired: Vec<String>, mut remove: F) -> Vec<String>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = StorageResult<()>>,
{
    let mut removed = Vec::with_capacity(expired.len());
    for namespace in expired {
        match remove(namespace.clone()).await {
            Ok(()) => removed.push(namespace),
            Err(err) => error!(namespace = %namespace, error = %err, "failed to remove namespace"),
        }
    }
    removed
}
