//! Spawner daemon: boots a VM per requested test and advertises its VNC
//! endpoint to runners.

mod image;
mod task;
mod vm;

pub use image::{ImageCache, ImageError, ImageSource, file_sha256, image_file_name, parse_manifest};
pub use task::{SpawnOutcome, SpawnerTask};
pub use vm::{EnvironmentLauncher, QemuLauncher, Requirements, Vm, VmError, VmSpec, qemu_args};
