//! The test harness process.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tracing::info;

/// VNC endpoint of a spawned VM, parsed from a test's `vnc_address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VncTarget {
    pub host: String,
    pub port: u16,
}

impl VncTarget {
    /// Parse `host:port`; `None` for anything else.
    pub fn parse(address: &str) -> Option<Self> {
        let (host, port) = address.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            port: port.parse().ok()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Harness {
    binary: String,
}

impl Harness {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn args(entrypoint: &str, outdir: &Path, test_case: &str) -> Vec<String> {
        vec![
            "--platform=Vnc".to_string(),
            entrypoint.to_string(),
            "--outdir".to_string(),
            outdir.display().to_string(),
            "--".to_string(),
            "--suite".to_string(),
            test_case.to_string(),
        ]
    }

    /// Start the harness inside `repo_dir` against `target`.
    pub fn spawn(
        &self,
        repo_dir: &Path,
        target: &VncTarget,
        entrypoint: &str,
        outdir: &Path,
        test_case: &str,
    ) -> Result<Child> {
        let mut command = Command::new(&self.binary);
        command
            .args(Self::args(entrypoint, outdir, test_case))
            .current_dir(repo_dir)
            .env("VNC_HOST", &target.host)
            .env("VNC_PORT", target.port.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .with_context(|| format!("failed to launch harness {}", self.binary))?;
        info!(
            pid = child.id(),
            harness = %self.binary,
            entrypoint,
            test_case,
            vnc_host = %target.host,
            vnc_port = target.port,
            "started harness"
        );
        Ok(child)
    }
}
