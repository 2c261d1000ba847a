//! Artifact bundles.

use std::io;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;

/// Pack the contents of `dir` into an in-memory `.tar.gz`, paths relative
/// to `dir`.
pub fn archive_dir(dir: &Path) -> io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all("", dir)?;
    builder.into_inner()?.finish()
}

/// [`archive_dir`] on the blocking pool.
pub async fn archive_dir_blocking(dir: PathBuf) -> io::Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || archive_dir(&dir))
        .await
        .map_err(io::Error::other)?
}
