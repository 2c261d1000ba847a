//! QEMU virtual machines.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::VmConfig;
use crate::db::{JobId, TestId};

const TPM_SOCKET_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("swtpm socket {0} did not appear")]
    TpmSocket(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What a test needs from its VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirements {
    pub tpm: bool,
    /// Live images boot from a cdrom and install onto a scratch disk.
    pub live_image: bool,
    pub disk_gb: u32,
}

impl Requirements {
    pub fn for_test(tpm: bool, image_url: &str, disk_gb: u32) -> Self {
        Self {
            tpm,
            live_image: image_url.ends_with(".iso"),
            disk_gb,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VmSpec {
    pub job_id: JobId,
    pub test_id: TestId,
    pub image: PathBuf,
    pub requirements: Requirements,
    pub vnc_display: u16,
}

/// A running VM and the resources created for it.
#[derive(Debug)]
pub struct Vm {
    child: Child,
    disk: Option<PathBuf>,
    tpm: Option<(Child, TempDir)>,
}

impl Vm {
    pub fn from_child(child: Child) -> Self {
        Self {
            child,
            disk: None,
            tpm: None,
        }
    }

    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    /// Kill anything still running and remove the scratch disk.
    pub async fn cleanup(mut self) {
        if let Err(err) = self.child.kill().await {
            debug!(error = %err, "vm already gone");
        }
        if let Some((mut swtpm, _state)) = self.tpm.take() {
            if let Err(err) = swtpm.kill().await {
                debug!(error = %err, "swtpm already gone");
            }
        }
        if let Some(disk) = self.disk.take() {
            if let Err(err) = tokio::fs::remove_file(&disk).await {
                warn!(disk = %disk.display(), error = %err, "failed to remove scratch disk");
            }
        }
    }
}

/// Boots execution environments.
#[async_trait]
pub trait EnvironmentLauncher: Send + Sync {
    async fn launch(&self, spec: &VmSpec) -> Result<Vm, VmError>;
}

/// Hypervisor arguments for a VM.
pub fn qemu_args(
    vm: &VmConfig,
    spec: &VmSpec,
    disk: Option<&Path>,
    tpm_socket: Option<&Path>,
) -> Vec<String> {
    let mut args: Vec<String> = [
        "-m".to_string(),
        vm.memory_mb.to_string(),
        "-smp".to_string(),
        vm.cores.to_string(),
        "-enable-kvm".to_string(),
        "-machine".to_string(),
        "pc,accel=kvm".to_string(),
        "-usbdevice".to_string(),
        "tablet".to_string(),
        "-vga".to_string(),
        "virtio".to_string(),
        "-vnc".to_string(),
        format!(":{},share=ignore", spec.vnc_display),
    ]
    .into();

    match disk {
        Some(disk) if spec.requirements.live_image => args.extend([
            "-boot".to_string(),
            "once=d".to_string(),
            "-cdrom".to_string(),
            spec.image.display().to_string(),
            "-hda".to_string(),
            disk.display().to_string(),
        ]),
        _ => args.extend([
            "-drive".to_string(),
            format!("format=raw,file={}", spec.image.display()),
        ]),
    }

    if let Some(socket) = tpm_socket {
        args.extend([
            "-chardev".to_string(),
            format!("socket,id=chrtpm,path={}", socket.display()),
            "-tpmdev".to_string(),
            "emulator,id=tpm0,chardev=chrtpm".to_string(),
            "-device".to_string(),
            "tpm-tis,tpmdev=tpm0".to_string(),
        ]);
    }
    args
}

/// Launches VMs with `qemu-system-x86_64`, `qemu-img` and `swtpm`.
pub struct QemuLauncher {
    vm: VmConfig,
    disk_dir: PathBuf,
    qemu: String,
    qemu_img: String,
    swtpm: String,
}

impl QemuLauncher {
    pub fn new(vm: VmConfig, disk_dir: impl Into<PathBuf>) -> Self {
        Self {
            vm,
            disk_dir: disk_dir.into(),
            qemu: "qemu-system-x86_64".to_string(),
            qemu_img: "qemu-img".to_string(),
            swtpm: "swtpm".to_string(),
        }
    }

    async fn create_disk(&self, spec: &VmSpec) -> Result<PathBuf, VmError> {
        let path = self
            .disk_dir
            .join(format!("{}-{}.qcow2", spec.job_id, Uuid::new_v4()));
        let output = Command::new(&self.qemu_img)
            .args(["create", "-f", "qcow2"])
            .arg(&path)
            .arg(format!("{}G", spec.requirements.disk_gb))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| VmError::Spawn {
                program: self.qemu_img.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(VmError::Command {
                program: self.qemu_img.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(disk = %path.display(), size_gb = spec.requirements.disk_gb, "created scratch disk");
        Ok(path)
    }

    async fn start_tpm(&self) -> Result<(Child, TempDir, PathBuf), VmError> {
        let state = tempfile::Builder::new().prefix("vmtest-tpm-").tempdir()?;
        let socket = state.path().join("swtpm-sock");
        let child = Command::new(&self.swtpm)
            .arg("socket")
            .arg("--tpmstate")
            .arg(format!("dir={}", state.path().display()))
            .arg("--ctrl")
            .arg(format!("type=unixio,path={}", socket.display()))
            .arg("--tpm2")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| VmError::Spawn {
                program: self.swtpm.clone(),
                source,
            })?;

        let deadline = tokio::time::Instant::now() + TPM_SOCKET_WAIT;
        while !tokio::fs::try_exists(&socket).await.unwrap_or(false) {
            if tokio::time::Instant::now() >= deadline {
                return Err(VmError::TpmSocket(socket));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok((child, state, socket))
    }
}

#[async_trait]
impl EnvironmentLauncher for QemuLauncher {
    async fn launch(&self, spec: &VmSpec) -> Result<Vm, VmError> {
        let disk = if spec.requirements.live_image {
            Some(self.create_disk(spec).await?)
        } else {
            None
        };

        let tpm = if spec.requirements.tpm {
            match self.start_tpm().await {
                Ok(tpm) => Some(tpm),
                Err(err) => {
                    if let Some(disk) = &disk {
                        tokio::fs::remove_file(disk).await.ok();
                    }
                    return Err(err);
                }
            }
        } else {
            None
        };

        let args = qemu_args(
            &self.vm,
            spec,
            disk.as_deref(),
            tpm.as_ref().map(|(_, _, socket)| socket.as_path()),
        );
        debug!(test_id = %spec.test_id, program = %self.qemu, ?args, "starting vm");
        let spawned = Command::new(&self.qemu)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let child = match spawned {
            Ok(child) => child,
            Err(source) => {
                if let Some(disk) = &disk {
                    tokio::fs::remove_file(disk).await.ok();
                }
                return Err(VmError::Spawn {
                    program: self.qemu.clone(),
                    source,
                });
            }
        };
        Ok(Vm {
            child,
            disk,
            tpm: tpm.map(|(child, state, _)| (child, state)),
        })
    }
}
