//! Local cache of VM images.
//!
//! An image is reused when the cached file's SHA-256 matches the sibling
//! `SHA256SUMS` manifest published next to it. Anything else (unknown host,
//! missing manifest, mismatch) triggers a fresh download.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode, Url};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

const MANIFEST_NAME: &str = "SHA256SUMS";

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("invalid image url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("{host} does not publish checksums")]
    NoChecksums { host: String },
    #[error("no checksum for {name} in {manifest}")]
    MissingChecksum { manifest: String, name: String },
    #[error("GET {url} returned {status}")]
    Status { url: String, status: StatusCode },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Resolves an image url to a file on local disk.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, image_url: &str) -> Result<PathBuf, ImageError>;
}

/// Cache file name for an image: the last path segment of its url.
pub fn image_file_name(url: &Url) -> Result<&str, ImageError> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .ok_or_else(|| ImageError::InvalidUrl {
            url: url.to_string(),
            reason: "url has no file name".to_string(),
        })
}

/// Find the checksum for `name` in a `SHA256SUMS` manifest.
///
/// Accepts both the binary (`<hash> *<name>`) and text (`<hash>  <name>`)
/// line forms.
pub fn parse_manifest(manifest: &str, name: &str) -> Option<String> {
    manifest.lines().find_map(|line| {
        let (hash, rest) = line.split_once(' ')?;
        let file = rest.trim_start_matches(' ').trim_start_matches('*');
        let valid = hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit());
        (valid && file == name).then(|| hash.to_ascii_lowercase())
    })
}

/// Hex SHA-256 of a file.
pub async fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub struct ImageCache {
    root: PathBuf,
    checksum_domains: Vec<String>,
    client: Client,
}

impl ImageCache {
    pub fn new(root: impl Into<PathBuf>, checksum_domains: Vec<String>) -> Self {
        Self {
            root: root.into(),
            checksum_domains,
            client: Client::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn remote_checksum(&self, url: &Url, name: &str) -> Result<String, ImageError> {
        let host = url.host_str().unwrap_or_default();
        if !self.checksum_domains.iter().any(|domain| domain == host) {
            return Err(ImageError::NoChecksums {
                host: host.to_string(),
            });
        }
        let manifest_url = url.join(MANIFEST_NAME).map_err(|err| ImageError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        let response = self.client.get(manifest_url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(ImageError::Status {
                url: manifest_url.to_string(),
                status: response.status(),
            });
        }
        let manifest = response.text().await?;
        parse_manifest(&manifest, name).ok_or_else(|| ImageError::MissingChecksum {
            manifest: manifest_url.to_string(),
            name: name.to_string(),
        })
    }

    async fn is_current(&self, url: &Url, name: &str, path: &Path) -> bool {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return false;
        }
        let remote = match self.remote_checksum(url, name).await {
            Ok(remote) => remote,
            Err(err) => {
                debug!(image = %url, error = %err, "cannot verify cached image");
                return false;
            }
        };
        match file_sha256(path).await {
            Ok(local) if local == remote => true,
            Ok(local) => {
                debug!(image = %url, %local, %remote, "cached image is outdated");
                false
            }
            Err(err) => {
                debug!(path = %path.display(), error = %err, "cannot hash cached image");
                false
            }
        }
    }

    /// Stream the image to a private temporary file in the cache, then rename
    /// it into place. A failed download removes its partial file.
    async fn download(&self, url: &Url, path: &Path, name: &str) -> Result<(), ImageError> {
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(ImageError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }

        let (partial, partial_path) = tempfile::Builder::new()
            .prefix(&format!(".{name}."))
            .suffix(".part")
            .tempfile_in(&self.root)?
            .into_parts();
        let mut file = File::from_std(partial);
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        partial_path.persist(path).map_err(|err| err.error)?;
        info!(image = %url, path = %path.display(), bytes = written, "downloaded image");
        Ok(())
    }
}

#[async_trait]
impl ImageSource for ImageCache {
    async fn fetch(&self, image_url: &str) -> Result<PathBuf, ImageError> {
        let url = Url::parse(image_url).map_err(|err| ImageError::InvalidUrl {
            url: image_url.to_string(),
            reason: err.to_string(),
        })?;
        let name = image_file_name(&url)?;
        let path = self.root.join(name);

        if self.is_current(&url, name, &path).await {
            debug!(image = %url, path = %path.display(), "using cached image");
            return Ok(path);
        }

        fs::create_dir_all(&self.root).await?;
        self.download(&url, &path, name).await?;
        Ok(path)
    }
}
