//! Provisioner loop: claims requested tests and keeps a VM alive for each.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::image::ImageSource;
use super::vm::{EnvironmentLauncher, Requirements, Vm, VmSpec};
use crate::backends::{BackendResult, ClaimedTest, TestLeaseBackend};
use crate::config::{LeaseConfig, PollInterval, VmConfig, VncEndpoint};
use crate::db::{TestId, TestState};
use crate::polling::run_loop;
use crate::process::{Heartbeat, Supervised, guarded, supervise_child};

/// How one provisioned test ended, from the spawner's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// Nothing was requested.
    Idle,
    /// The test reached a state that no longer needs the VM.
    Released,
    /// The VM died or asked for a retry; the test went back to the queue.
    Requeued,
    /// The VM exited after the runner took over.
    VmExited,
    Shutdown,
}

pub struct SpawnerTask<B> {
    backend: B,
    images: Arc<dyn ImageSource>,
    launcher: Arc<dyn EnvironmentLauncher>,
    vnc: VncEndpoint,
    vm: VmConfig,
    lease: LeaseConfig,
}

impl<B> SpawnerTask<B>
where
    B: TestLeaseBackend,
{
    pub fn new(
        backend: B,
        images: Arc<dyn ImageSource>,
        launcher: Arc<dyn EnvironmentLauncher>,
        vnc: VncEndpoint,
        vm: VmConfig,
        lease: LeaseConfig,
    ) -> Self {
        Self {
            backend,
            images,
            launcher,
            vnc,
            vm,
            lease,
        }
    }

    /// Claim one requested test and provision it until its VM is no longer
    /// needed.
    pub async fn tick(&self, mut shutdown: watch::Receiver<bool>) -> Result<SpawnOutcome> {
        let Some(claimed) = self
            .backend
            .claim_test(TestState::Requested, TestState::Spawning, false)
            .await
            .context("failed to claim requested test")?
        else {
            return Ok(SpawnOutcome::Idle);
        };
        let id = claimed.test.id;
        info!(
            test_id = %id,
            job_id = %claimed.test.job_id,
            test_case = %claimed.test.test_case,
            priority = claimed.priority,
            "claimed test for provisioning"
        );

        let prepared = guarded(
            self.prepare(&claimed),
            self.lease.heartbeat_interval,
            &mut shutdown,
            || self.beat(id, TestState::Spawning),
        )
        .await;
        let vm = match prepared {
            Supervised::Finished(Ok(vm)) => vm,
            Supervised::Finished(Err(err)) => {
                // Left `spawning`: staleness recovery hands it out again.
                return Err(err.context(format!("failed to provision test {id}")));
            }
            Supervised::Released => {
                warn!(test_id = %id, "lost test while preparing its vm");
                return Ok(SpawnOutcome::Released);
            }
            Supervised::Shutdown => {
                self.requeue(id, TestState::Spawning).await;
                return Ok(SpawnOutcome::Shutdown);
            }
        };

        let outcome = self.publish_and_watch(id, vm, &mut shutdown).await;
        if let Ok(outcome) = &outcome {
            info!(test_id = %id, ?outcome, "provisioning finished");
        }
        outcome
    }

    async fn prepare(&self, claimed: &ClaimedTest) -> Result<Vm> {
        let image = self
            .images
            .fetch(&claimed.image_url)
            .await
            .with_context(|| format!("failed to fetch image {}", claimed.image_url))?;
        let spec = VmSpec {
            job_id: claimed.test.job_id,
            test_id: claimed.test.id,
            image,
            requirements: Requirements::for_test(
                claimed.test.tpm,
                &claimed.image_url,
                self.vm.disk_gb,
            ),
            vnc_display: self.vnc.display(),
        };
        debug!(test_id = %spec.test_id, requirements = ?spec.requirements, "launching vm");
        Ok(self.launcher.launch(&spec).await?)
    }

    async fn publish_and_watch(
        &self,
        id: TestId,
        mut vm: Vm,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SpawnOutcome> {
        let address = self.vnc.address();
        let published: BackendResult<bool> = async {
            self.backend.set_vnc_address(id, &address).await?;
            self.backend
                .transition(id, TestState::Spawning, TestState::Spawned)
                .await
        }
        .await;
        match published {
            Ok(true) => info!(test_id = %id, vnc_address = %address, "vm spawned"),
            Ok(false) => {
                warn!(test_id = %id, "test reclaimed before its vm was published");
                vm.cleanup().await;
                return Ok(SpawnOutcome::Released);
            }
            Err(err) => {
                vm.cleanup().await;
                self.requeue(id, TestState::Spawning).await;
                return Err(anyhow::Error::new(err).context("failed to publish vm address"));
            }
        }

        let supervised = supervise_child(
            vm.child_mut(),
            self.lease.heartbeat_interval,
            shutdown,
            || self.watch_test(id),
        )
        .await;

        let outcome = match supervised {
            Ok(Supervised::Finished(status)) => {
                let state = self.current_state(id).await;
                if status.code() == Some(self.lease.tempfail_exit_code) {
                    warn!(test_id = %id, ?state, "vm exited with tempfail");
                    match state {
                        Some(state @ (TestState::Spawned | TestState::Running)) => {
                            self.requeue(id, state).await;
                            SpawnOutcome::Requeued
                        }
                        _ => SpawnOutcome::Released,
                    }
                } else if state == Some(TestState::Spawned) {
                    warn!(test_id = %id, %status, "vm died before a runner claimed it");
                    self.requeue(id, TestState::Spawned).await;
                    SpawnOutcome::Requeued
                } else {
                    info!(test_id = %id, %status, ?state, "vm exited");
                    SpawnOutcome::VmExited
                }
            }
            Ok(Supervised::Released) => SpawnOutcome::Released,
            Ok(Supervised::Shutdown) => {
                if self.current_state(id).await == Some(TestState::Spawned) {
                    self.requeue(id, TestState::Spawned).await;
                }
                SpawnOutcome::Shutdown
            }
            Err(err) => {
                vm.cleanup().await;
                return Err(anyhow::Error::new(err).context("failed to supervise vm"));
            }
        };

        vm.cleanup().await;
        Ok(outcome)
    }

    /// Heartbeat for a test the spawner still owns exclusively.
    async fn beat(&self, id: TestId, state: TestState) -> Heartbeat {
        match self.backend.heartbeat(id, state).await {
            Ok(true) => Heartbeat::Continue,
            Ok(false) => Heartbeat::Release,
            Err(err) => {
                warn!(test_id = %id, error = ?err, "heartbeat failed");
                Heartbeat::Continue
            }
        }
    }

    /// Heartbeat while the VM lives.
    ///
    /// A `spawned` test is refreshed here; a `running` one belongs to the
    /// runner. Once the test is finished or requeued the VM is released.
    async fn watch_test(&self, id: TestId) -> Heartbeat {
        match self.backend.test_state(id).await {
            Ok(Some(TestState::Spawned)) => {
                // A failed refresh means a runner just claimed the test.
                if let Err(err) = self.backend.heartbeat(id, TestState::Spawned).await {
                    warn!(test_id = %id, error = ?err, "heartbeat failed");
                }
                Heartbeat::Continue
            }
            Ok(Some(TestState::Running)) => Heartbeat::Continue,
            Ok(state) => {
                debug!(test_id = %id, ?state, "test no longer needs its vm");
                Heartbeat::Release
            }
            Err(err) => {
                warn!(test_id = %id, error = ?err, "failed to read test state");
                Heartbeat::Continue
            }
        }
    }

    async fn current_state(&self, id: TestId) -> Option<TestState> {
        match self.backend.test_state(id).await {
            Ok(state) => state,
            Err(err) => {
                error!(test_id = %id, error = ?err, "failed to read test state");
                None
            }
        }
    }

    async fn requeue(&self, id: TestId, from: TestState) {
        match self.backend.requeue(id, from).await {
            Ok(true) => info!(test_id = %id, from = %from, "requeued test"),
            Ok(false) => debug!(test_id = %id, from = %from, "test moved on before requeue"),
            Err(err) => error!(test_id = %id, error = ?err, "failed to requeue test"),
        }
    }

    /// Provision tests until shutdown is requested.
    pub async fn run(self, poll: PollInterval, shutdown: watch::Receiver<bool>) {
        let task = &self;
        run_loop("spawner", poll, shutdown, |shutdown| async move {
            task.tick(shutdown).await.map(|_| ())
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::process::Stdio;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::process::Command;

    use super::*;
    use crate::backends::MemoryBackend;
    use crate::scheduler::reset_stale_tests;
    use crate::spawner::{ImageError, VmError};
    use crate::test_support::{job_with_tests, sample_job};

    struct StubImages {
        fail: bool,
    }

    #[async_trait]
    impl ImageSource for StubImages {
        async fn fetch(&self, image_url: &str) -> Result<PathBuf, ImageError> {
            if self.fail {
                return Err(ImageError::InvalidUrl {
                    url: image_url.to_string(),
                    reason: "unreachable".to_string(),
                });
            }
            Ok(PathBuf::from("/cache/noble.iso"))
        }
    }

    /// Runs a shell script in place of the hypervisor.
    struct ScriptLauncher {
        script: &'static str,
        launched: Mutex<Vec<VmSpec>>,
    }

    #[async_trait]
    impl EnvironmentLauncher for ScriptLauncher {
        async fn launch(&self, spec: &VmSpec) -> Result<Vm, VmError> {
            self.launched
                .lock()
                .expect("launched poisoned")
                .push(spec.clone());
            let child = Command::new("sh")
                .args(["-c", self.script])
                .stdout(Stdio::null())
                .kill_on_drop(true)
                .spawn()?;
            Ok(Vm::from_child(child))
        }
    }

    fn task(
        backend: MemoryBackend,
        script: &'static str,
        fail_images: bool,
    ) -> Arc<SpawnerTask<MemoryBackend>> {
        Arc::new(SpawnerTask::new(
            backend,
            Arc::new(StubImages { fail: fail_images }),
            Arc::new(ScriptLauncher {
                script,
                launched: Mutex::new(Vec::new()),
            }),
            VncEndpoint::new("10.0.0.5", 5901).expect("endpoint"),
            VmConfig::default(),
            LeaseConfig {
                heartbeat_interval: Duration::from_millis(20),
                tempfail_exit_code: 75,
            },
        ))
    }

    async fn wait_for_state(backend: &MemoryBackend, id: TestId, state: TestState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if backend.test_state(id).await.expect("state") == Some(state) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("test never reached expected state");
    }

    #[tokio::test]
    async fn idle_when_nothing_is_requested() {
        let spawner = task(MemoryBackend::new(), "exit 0", false);
        let (_tx, rx) = watch::channel(false);
        assert_eq!(spawner.tick(rx).await.expect("tick"), SpawnOutcome::Idle);
    }

    #[tokio::test]
    async fn vm_death_while_spawned_requeues_the_test() {
        let backend = MemoryBackend::new();
        let (_, ids) = job_with_tests(&backend, sample_job(0), &[TestState::Requested]).await;
        let spawner = task(backend.clone(), "sleep 0.2; exit 1", false);
        let (_tx, rx) = watch::channel(false);

        let outcome = spawner.tick(rx).await.expect("tick");

        assert_eq!(outcome, SpawnOutcome::Requeued);
        let test = backend.test(ids[0]).expect("test").expect("exists");
        assert_eq!(test.state, TestState::Requested);
        assert_eq!(test.vnc_address, "");
    }

    #[tokio::test]
    async fn finished_test_releases_the_vm() {
        let backend = MemoryBackend::new();
        let (_, ids) = job_with_tests(&backend, sample_job(0), &[TestState::Requested]).await;
        let spawner = task(backend.clone(), "sleep 30", false);
        let (_tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let spawner = Arc::clone(&spawner);
            async move { spawner.tick(rx).await }
        });

        wait_for_state(&backend, ids[0], TestState::Spawned).await;
        let test = backend.test(ids[0]).expect("test").expect("exists");
        assert_eq!(test.vnc_address, "10.0.0.5:5901");
        let runner = backend
            .claim_test(TestState::Spawned, TestState::Running, true)
            .await
            .expect("claim")
            .expect("claimed");
        assert!(
            backend
                .finish_test(runner.test.id, "http://artifacts/results.tar.gz", TestState::Pass)
                .await
                .expect("finish")
        );

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("vm released")
            .expect("join")
            .expect("tick");
        assert_eq!(outcome, SpawnOutcome::Released);
        assert_eq!(
            backend.test_state(ids[0]).await.expect("state"),
            Some(TestState::Pass)
        );
    }

    #[tokio::test]
    async fn tempfail_exit_requeues_a_running_test() {
        let backend = MemoryBackend::new();
        let (_, ids) = job_with_tests(&backend, sample_job(0), &[TestState::Requested]).await;
        let spawner = task(backend.clone(), "sleep 0.5; exit 75", false);
        let (_tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let spawner = Arc::clone(&spawner);
            async move { spawner.tick(rx).await }
        });

        wait_for_state(&backend, ids[0], TestState::Spawned).await;
        backend
            .claim_test(TestState::Spawned, TestState::Running, true)
            .await
            .expect("claim")
            .expect("claimed");

        let outcome = handle.await.expect("join").expect("tick");
        assert_eq!(outcome, SpawnOutcome::Requeued);
        let test = backend.test(ids[0]).expect("test").expect("exists");
        assert_eq!(test.state, TestState::Requested);
        assert_eq!(test.vnc_address, "");
    }

    #[tokio::test]
    async fn spawned_test_heartbeat_is_refreshed() {
        let backend = MemoryBackend::new();
        let (_, ids) = job_with_tests(&backend, sample_job(0), &[TestState::Requested]).await;
        let spawner = task(backend.clone(), "sleep 30", false);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let spawner = Arc::clone(&spawner);
            async move { spawner.tick(rx).await }
        });

        wait_for_state(&backend, ids[0], TestState::Spawned).await;
        backend
            .backdate_test(ids[0], Duration::from_secs(600))
            .expect("backdate");
        tokio::time::sleep(Duration::from_millis(200)).await;
        let test = backend.test(ids[0]).expect("test").expect("exists");
        assert!(chrono::Utc::now() - test.updated_at < chrono::Duration::seconds(60));

        tx.send(true).expect("shutdown");
        let outcome = handle.await.expect("join").expect("tick");
        assert_eq!(outcome, SpawnOutcome::Shutdown);
        assert_eq!(
            backend.test_state(ids[0]).await.expect("state"),
            Some(TestState::Requested)
        );
    }

    #[tokio::test]
    async fn image_failure_is_left_for_staleness_recovery() {
        let backend = MemoryBackend::new();
        let (_, ids) = job_with_tests(&backend, sample_job(0), &[TestState::Requested]).await;
        let spawner = task(backend.clone(), "exit 0", true);
        let (_tx, rx) = watch::channel(false);

        let result = spawner.tick(rx.clone()).await;

        assert!(result.is_err());
        assert_eq!(
            backend.test_state(ids[0]).await.expect("state"),
            Some(TestState::Spawning)
        );
        // Nothing else is claimable until the lease goes stale.
        assert_eq!(spawner.tick(rx).await.expect("tick"), SpawnOutcome::Idle);

        backend
            .backdate_test(ids[0], Duration::from_secs(600))
            .expect("backdate");
        let reset = reset_stale_tests(&backend, Duration::from_secs(120))
            .await
            .expect("reset");
        assert_eq!(reset, 1);
        assert_eq!(
            backend.test_state(ids[0]).await.expect("state"),
            Some(TestState::Requested)
        );
    }

    #[tokio::test]
    async fn launch_uses_test_requirements_and_display() {
        let backend = MemoryBackend::new();
        let mut job = sample_job(0);
        job.image_url = "https://cloud-images.example.com/noble.img".to_string();
        job_with_tests(&backend, job, &[TestState::Requested]).await;
        let launcher = Arc::new(ScriptLauncher {
            script: "exit 1",
            launched: Mutex::new(Vec::new()),
        });
        let spawner = SpawnerTask::new(
            backend,
            Arc::new(StubImages { fail: false }),
            launcher.clone(),
            VncEndpoint::new("spawner-1", 5903).expect("endpoint"),
            VmConfig::default(),
            LeaseConfig::default(),
        );
        let (_tx, rx) = watch::channel(false);

        spawner.tick(rx).await.expect("tick");

        let launched = launcher.launched.lock().expect("launched poisoned");
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].vnc_display, 3);
        assert!(!launched[0].requirements.live_image);
        assert_eq!(launched[0].requirements.disk_gb, 40);
    }
}
