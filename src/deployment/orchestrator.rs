// SPDX-License-Identifier: MIT
//! C7 — Orchestrator. Structured like the daemon's `SessionManager`: an
//! `active` map of cancel handles keyed by deployment ID, one background
//! task per in-flight deployment, a `drain()` for graceful shutdown, and a
//! supervisory stall sweep spawned alongside the server loop.

use crate::config::{ORCHESTRATOR_BUDGET_SECS, STALL_SWEEP_GRACE_SECS};
use crate::deployment::log::LogStream;
use crate::deployment::model::{Deployment, DeploymentLog, DeploymentStatus, LogLevel, Phase};
use crate::deployment::store::{NewDeployment, Storage, TransitionPatch};
use crate::drivers::tokio_util_cancel::{self, CancelSource, CancelToken};
use crate::drivers::{poll_until_terminal, ProviderDriver};
use crate::error::{ErrorKind, OrchestratorError};
use crate::events::{DeploymentOutcome, EventSink};
use crate::planner::{self, BuildPlan};
use crate::snapshot::SnapshotReader;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub struct StartRequest {
    pub project_id: String,
    pub user_id: String,
    pub provider: String,
    pub environment: String,
    pub branch: String,
    pub user_plan: BuildPlan,
    /// Caller-context flag forwarded verbatim to `SnapshotReader::read`
    /// (source spec §4.1): non-privileged callers never see files marked
    /// `protected`. Not persisted on the `Deployment` row — it describes who
    /// is asking, not a property of the deployment itself.
    pub privileged: bool,
}

struct ActiveDeployment {
    cancel: CancelSource,
    join: JoinHandle<()>,
}

pub struct Orchestrator {
    storage: Arc<Storage>,
    logs: Arc<LogStream>,
    snapshots: Arc<dyn SnapshotReader>,
    drivers: HashMap<String, Arc<dyn ProviderDriver>>,
    events: Arc<dyn EventSink>,
    active: RwLock<HashMap<Uuid, ActiveDeployment>>,
}

impl Orchestrator {
    pub fn new(
        storage: Arc<Storage>,
        logs: Arc<LogStream>,
        snapshots: Arc<dyn SnapshotReader>,
        drivers: HashMap<String, Arc<dyn ProviderDriver>>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            storage,
            logs,
            snapshots,
            drivers,
            events,
            active: RwLock::new(HashMap::new()),
        }
    }

    pub fn registered_providers(&self) -> Vec<&str> {
        self.drivers.keys().map(String::as_str).collect()
    }

    /// `Start(user_id, config) -> Deployment` (source spec §4.7, op 1).
    pub async fn start(self: &Arc<Self>, req: StartRequest) -> Result<Deployment, OrchestratorError> {
        let driver = self
            .drivers
            .get(&req.provider)
            .cloned()
            .ok_or_else(|| OrchestratorError::invalid_config(format!("unknown provider: {}", req.provider)))?;

        driver.validate_config(&req.user_plan).await?;

        let deployment = self
            .storage
            .create_deployment(NewDeployment {
                project_id: req.project_id.clone(),
                user_id: req.user_id,
                provider: req.provider,
                environment: req.environment,
                branch: req.branch,
                config_snapshot: req.user_plan.clone(),
            })
            .await
            .map_err(|e| OrchestratorError::new(ErrorKind::InternalError, e.to_string()))?;

        let (source, token) = tokio_util_cancel::channel();
        let deployment_id = deployment.id;
        let project_id = req.project_id;
        let user_plan = req.user_plan;
        let privileged = req.privileged;
        let this = Arc::clone(self);

        let run_join = tokio::spawn(async move {
            this.run_deployment(deployment_id, token, project_id, driver, user_plan, privileged).await;
        });

        // `run_deployment` cleans up after itself on every outcome it can see,
        // but a panic inside it unwinds straight through `tokio::spawn` and
        // skips that cleanup entirely. A supervisor task owns the resulting
        // `JoinHandle` so a panic is still observed and converted into a
        // `failed`/`internal_error` outcome instead of an active-map entry
        // that never resolves.
        let supervisor = Arc::clone(self);
        let join = tokio::spawn(async move {
            if let Err(join_err) = run_join.await {
                if join_err.is_panic() {
                    supervisor.handle_panicked_deployment(deployment_id).await;
                }
            }
        });

        self.active
            .write()
            .await
            .insert(deployment_id, ActiveDeployment { cancel: source, join });

        Ok(deployment)
    }

    /// `Status(deployment_id) -> Deployment` (op 2). Never touches the driver.
    pub async fn status(&self, id: Uuid) -> Result<Deployment, OrchestratorError> {
        self.storage
            .find_deployment(id)
            .await
            .map_err(|e| OrchestratorError::new(ErrorKind::InternalError, e.to_string()))?
            .ok_or_else(|| OrchestratorError::not_found(format!("no such deployment: {id}")))
    }

    /// `Cancel(deployment_id)` (op 3). Idempotent; terminal deployments
    /// return `already_terminal`.
    pub async fn cancel(&self, id: Uuid) -> Result<(), OrchestratorError> {
        {
            let active = self.active.read().await;
            if let Some(handle) = active.get(&id) {
                handle.cancel.cancel();
                return Ok(());
            }
        }
        // Not in the active map: either unknown, already terminal, or the
        // owning task is in the small window between finishing and
        // unregistering itself. All three cases are reported the same way
        // to the caller — there is nothing left to cancel.
        let deployment = self.status(id).await?;
        if deployment.status.is_terminal() {
            Err(OrchestratorError::already_terminal(format!("deployment {id} already {}", deployment.status)))
        } else {
            Err(OrchestratorError::already_terminal(format!("deployment {id} is finishing")))
        }
    }

    /// `Logs(deployment_id, limit?) -> DeploymentLog[]` (op 4).
    pub async fn logs(&self, id: Uuid, since_seq: Option<i64>, limit: Option<i64>) -> Result<Vec<DeploymentLog>, OrchestratorError> {
        self.logs
            .tail(id, since_seq, limit)
            .await
            .map_err(|e| OrchestratorError::new(ErrorKind::InternalError, e.to_string()))
    }

    /// `History(project_id, page, limit) -> (Deployment[], total)` (op 5).
    pub async fn history(&self, project_id: &str, page: u32, limit: u32) -> Result<(Vec<Deployment>, i64), OrchestratorError> {
        self.storage
            .list_deployments(project_id, page, limit)
            .await
            .map_err(|e| OrchestratorError::new(ErrorKind::InternalError, e.to_string()))
    }

    /// `Redeploy(deployment_id, user_id) -> Deployment` (op 6). Re-reads
    /// `config_snapshot` from the original and calls `Start`; rejects if
    /// `user_id` does not match the original owner. `privileged` is the
    /// redeploy caller's own context, not inherited from the original
    /// deployment.
    pub async fn redeploy(self: &Arc<Self>, id: Uuid, user_id: &str, privileged: bool) -> Result<Deployment, OrchestratorError> {
        let original = self.status(id).await?;
        if original.user_id != user_id {
            return Err(OrchestratorError::unauthorized("redeploy requester does not own the original deployment"));
        }
        self.start(StartRequest {
            project_id: original.project_id,
            user_id: user_id.to_string(),
            provider: original.provider,
            environment: original.environment,
            branch: original.branch,
            user_plan: original.config_snapshot,
            privileged,
        })
        .await
    }

    /// Cancel every in-flight deployment and wait for their tasks to exit.
    /// Mirrors the teacher's `SessionManager::drain` graceful-shutdown step.
    pub async fn drain(&self) {
        let entries: Vec<(Uuid, ActiveDeployment)> = self.active.write().await.drain().collect();
        let mut joins = Vec::with_capacity(entries.len());
        for (_, active) in entries {
            active.cancel.cancel();
            joins.push(active.join);
        }
        for join in joins {
            let _ = join.await;
        }
    }

    /// Supervisory stall sweep: any row stuck non-terminal for longer than
    /// (orchestrator budget + grace) is force-failed with `stall_detected`.
    /// Idempotent by construction — `transition` only matches non-terminal
    /// `from` statuses, so a task that finishes first wins the race.
    pub async fn sweep_stalled(&self) -> Result<u64, OrchestratorError> {
        let threshold = Duration::from_secs(ORCHESTRATOR_BUDGET_SECS + STALL_SWEEP_GRACE_SECS);
        let count = self
            .storage
            .fail_stalled_since(threshold)
            .await
            .map_err(|e| OrchestratorError::new(ErrorKind::InternalError, e.to_string()))?;
        for _ in 0..count {
            self.events.stall_detected();
        }
        Ok(count)
    }

    /// Startup recovery: force-fail every row left non-terminal by a
    /// previous process that was killed mid-deployment. Call once before
    /// accepting requests — no supervisory task survives a restart to
    /// finalize those rows itself.
    pub async fn recover_stale_deployments(&self) -> Result<u64, OrchestratorError> {
        let count = self
            .storage
            .recover_stale_deployments()
            .await
            .map_err(|e| OrchestratorError::new(ErrorKind::InternalError, e.to_string()))?;
        for _ in 0..count {
            self.events.internal_error();
        }
        Ok(count)
    }

    /// Spawn the stall sweep as a recurring background task, run next to the
    /// main server loop (teacher's pattern for maintenance tasks in
    /// `run_server`). The interval is re-read from `hot` before every sleep,
    /// so a config hot-reload takes effect on the next cycle without a
    /// restart.
    pub fn spawn_stall_sweep(self: &Arc<Self>, hot: crate::config::SharedHotConfig) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = Duration::from_secs(hot.read().await.stall_sweep_interval_secs);
                tokio::time::sleep(interval).await;
                if let Err(err) = this.sweep_stalled().await {
                    tracing::warn!(error = %err, "stall sweep failed");
                }
            }
        })
    }

    async fn run_deployment(
        self: Arc<Self>,
        id: Uuid,
        cancel: CancelToken,
        project_id: String,
        driver: Arc<dyn ProviderDriver>,
        user_plan: BuildPlan,
        privileged: bool,
    ) {
        let budget = Duration::from_secs(ORCHESTRATOR_BUDGET_SECS);
        let outcome = tokio::time::timeout(
            budget,
            self.attempt(id, &cancel, &project_id, driver.as_ref(), user_plan, privileged),
        )
        .await;

        let (to, outcome, error_message) = match outcome {
            Ok(Ok(())) => (DeploymentStatus::Live, DeploymentOutcome::Live, None),
            Ok(Err(err)) if err.kind == ErrorKind::Cancelled => {
                (DeploymentStatus::Cancelled, DeploymentOutcome::Cancelled, Some(err.as_error_message()))
            }
            Ok(Err(err)) => (DeploymentStatus::Failed, DeploymentOutcome::Failed, Some(err.as_error_message())),
            Err(_elapsed) => {
                let timeout = OrchestratorError::new(ErrorKind::OrchestratorTimeout, "30 minute overall budget exceeded");
                (DeploymentStatus::Failed, DeploymentOutcome::Failed, Some(timeout.as_error_message()))
            }
        };

        // `attempt` already wrote the `live` transition itself on success (it
        // needs to attach url/preview_url there); for the failure/cancel
        // paths it bailed out early on error, so the terminal write happens
        // here instead. Either way the `from` set covers every non-terminal
        // status so a late write can never clobber one that already landed.
        if to != DeploymentStatus::Live {
            let _ = self
                .storage
                .transition(
                    id,
                    &[
                        DeploymentStatus::Pending,
                        DeploymentStatus::Preparing,
                        DeploymentStatus::Building,
                        DeploymentStatus::Deploying,
                    ],
                    to,
                    TransitionPatch {
                        error_message,
                        set_completed_at: true,
                        ..Default::default()
                    },
                )
                .await;
        }

        self.active.write().await.remove(&id);
        self.events.deployment_finalized(outcome);
    }

    /// Finalizes a deployment whose background task panicked rather than
    /// returning normally. `run_deployment` never gets a chance to run its
    /// own terminal-write, so this is that write's stand-in.
    async fn handle_panicked_deployment(&self, id: Uuid) {
        let err = OrchestratorError::new(ErrorKind::InternalError, "deployment task panicked");
        let _ = self
            .storage
            .transition(
                id,
                &[
                    DeploymentStatus::Pending,
                    DeploymentStatus::Preparing,
                    DeploymentStatus::Building,
                    DeploymentStatus::Deploying,
                ],
                DeploymentStatus::Failed,
                TransitionPatch {
                    error_message: Some(err.as_error_message()),
                    set_completed_at: true,
                    ..Default::default()
                },
            )
            .await;
        self.active.write().await.remove(&id);
        self.events.internal_error();
        self.events.deployment_finalized(DeploymentOutcome::Failed);
    }

    /// Runs the §4.7 background-task algorithm. On success, the `live`
    /// transition has already been written. On error, the caller is
    /// responsible for the terminal write.
    async fn attempt(
        &self,
        id: Uuid,
        cancel: &CancelToken,
        project_id: &str,
        driver: &dyn ProviderDriver,
        user_plan: BuildPlan,
        privileged: bool,
    ) -> Result<(), OrchestratorError> {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::new(ErrorKind::Cancelled, "cancelled before start"));
        }

        self.storage
            .transition(id, &[DeploymentStatus::Pending], DeploymentStatus::Preparing, TransitionPatch::default())
            .await
            .map_err(internal)?;
        self.logs.append(id, LogLevel::Info, Phase::Prepare, "Preparing deployment…", None, None).await.map_err(internal)?;

        let files = self
            .snapshots
            .read(project_id, privileged)
            .await
            .map_err(|e| OrchestratorError::new(ErrorKind::InvalidSnapshot, e.to_string()))?;

        if cancel.is_cancelled() {
            return Err(OrchestratorError::new(ErrorKind::Cancelled, "cancelled after snapshot read"));
        }

        let plan = planner::infer_missing(&user_plan, &files);
        self.storage.update_config_snapshot(id, &plan).await.map_err(internal)?;

        self.storage
            .transition(id, &[DeploymentStatus::Preparing], DeploymentStatus::Building, TransitionPatch::default())
            .await
            .map_err(internal)?;
        let build_start = tokio::time::Instant::now();

        let package = crate::packager::package(&files, &plan)?;
        let build_time_ms = build_start.elapsed().as_millis() as i64;

        if cancel.is_cancelled() {
            return Err(OrchestratorError::new(ErrorKind::Cancelled, "cancelled after package"));
        }

        self.storage
            .transition(
                id,
                &[DeploymentStatus::Building],
                DeploymentStatus::Deploying,
                TransitionPatch {
                    build_time_ms: Some(build_time_ms),
                    ..Default::default()
                },
            )
            .await
            .map_err(internal)?;
        let deploy_start = tokio::time::Instant::now();

        let mut result = driver.deploy(&plan, &package, cancel.clone()).await?;
        if !result.is_terminal() {
            result = poll_until_terminal(driver, &result.provider_id, driver.poll_policy(), cancel).await?;
        }
        let deploy_time_ms = deploy_start.elapsed().as_millis() as i64;

        for line in &result.log_lines {
            self.logs.append(id, LogLevel::Info, Phase::Deploy, line.clone(), None, None).await.map_err(internal)?;
        }

        if result.status == DeploymentStatus::Live {
            self.storage
                .transition(
                    id,
                    &[DeploymentStatus::Deploying],
                    DeploymentStatus::Live,
                    TransitionPatch {
                        url: result.url,
                        preview_url: result.preview_url,
                        deploy_time_ms: Some(deploy_time_ms),
                        total_time_ms: Some(build_time_ms + deploy_time_ms),
                        set_completed_at: true,
                        ..Default::default()
                    },
                )
                .await
                .map_err(internal)?;
            Ok(())
        } else {
            Err(result.error.unwrap_or_else(|| OrchestratorError::new(ErrorKind::ProviderRejected, "provider returned a non-live terminal status")))
        }
    }
}

fn internal(err: anyhow::Error) -> OrchestratorError {
    OrchestratorError::new(ErrorKind::InternalError, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::static_driver::StaticDriver;
    use crate::events::CountingEventSink;
    use crate::snapshot::{InMemorySnapshotReader, ProjectFile};
    use std::sync::atomic::Ordering;
    use std::time::Duration as StdDuration;

    async fn test_orchestrator(driver: StaticDriver) -> (Arc<Orchestrator>, Arc<CountingEventSink>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(Box::leak(Box::new(dir)).path()).await.unwrap());
        let logs = Arc::new(LogStream::new(storage.pool().clone()));
        let snapshots = Arc::new(InMemorySnapshotReader::new());
        snapshots
            .put("proj-1", vec![ProjectFile::file("/index.html", "<h1>Hi</h1>", "text/html")])
            .await;

        let mut drivers: HashMap<String, Arc<dyn ProviderDriver>> = HashMap::new();
        drivers.insert("static-v1".to_string(), Arc::new(driver));

        let events = CountingEventSink::new();
        let orchestrator = Arc::new(Orchestrator::new(storage, logs, snapshots, drivers, events.clone()));
        (orchestrator, events)
    }

    /// Like `test_orchestrator`, but wraps the snapshot reader in
    /// `PolicyFilteringReader` (matching production wiring in `AppContext::
    /// bootstrap`) and seeds one protected and one public file, returning a
    /// handle to the driver so a test can inspect what it actually received.
    async fn test_orchestrator_with_protected_file(driver: StaticDriver) -> (Arc<Orchestrator>, Arc<StaticDriver>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(Box::leak(Box::new(dir)).path()).await.unwrap());
        let logs = Arc::new(LogStream::new(storage.pool().clone()));
        let inner = InMemorySnapshotReader::new();
        let mut secret = ProjectFile::file("/.env", "SECRET=1", "text/plain");
        secret.protected = true;
        inner
            .put("proj-1", vec![ProjectFile::file("/index.html", "<h1>Hi</h1>", "text/html"), secret])
            .await;
        let snapshots = Arc::new(crate::snapshot::PolicyFilteringReader::new(inner));

        let driver = Arc::new(driver);
        let mut drivers: HashMap<String, Arc<dyn ProviderDriver>> = HashMap::new();
        drivers.insert("static-v1".to_string(), driver.clone());

        let events = CountingEventSink::new();
        let orchestrator = Arc::new(Orchestrator::new(storage, logs, snapshots, drivers, events));
        (orchestrator, driver)
    }

    #[tokio::test]
    async fn non_privileged_start_never_packages_protected_files() {
        let (orchestrator, driver) = test_orchestrator_with_protected_file(StaticDriver::default()).await;
        let deployment = orchestrator
            .start(StartRequest {
                project_id: "proj-1".into(),
                user_id: "user-1".into(),
                provider: "static-v1".into(),
                environment: "production".into(),
                branch: "main".into(),
                user_plan: BuildPlan::default(),
                privileged: false,
            })
            .await
            .unwrap();

        for _ in 0..50 {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            if orchestrator.status(deployment.id).await.unwrap().status.is_terminal() {
                break;
            }
        }
        let paths = driver.last_package_paths().await;
        assert!(paths.contains(&"index.html".to_string()));
        assert!(!paths.contains(&".env".to_string()), "protected file leaked into a non-privileged deployment: {paths:?}");
    }

    #[tokio::test]
    async fn privileged_start_packages_protected_files() {
        let (orchestrator, driver) = test_orchestrator_with_protected_file(StaticDriver::default()).await;
        let deployment = orchestrator
            .start(StartRequest {
                project_id: "proj-1".into(),
                user_id: "user-1".into(),
                provider: "static-v1".into(),
                environment: "production".into(),
                branch: "main".into(),
                user_plan: BuildPlan::default(),
                privileged: true,
            })
            .await
            .unwrap();

        for _ in 0..50 {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            if orchestrator.status(deployment.id).await.unwrap().status.is_terminal() {
                break;
            }
        }
        let paths = driver.last_package_paths().await;
        assert!(paths.contains(&".env".to_string()), "privileged deployment did not see the protected file: {paths:?}");
    }

    #[tokio::test]
    async fn happy_path_reaches_live_and_emits_finalization() {
        let (orchestrator, events) = test_orchestrator(StaticDriver::default()).await;
        let deployment = orchestrator
            .start(StartRequest {
                project_id: "proj-1".into(),
                user_id: "user-1".into(),
                provider: "static-v1".into(),
                environment: "production".into(),
                branch: "main".into(),
                user_plan: BuildPlan::default(),
                privileged: false,
            })
            .await
            .unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Pending);

        for _ in 0..50 {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            let current = orchestrator.status(deployment.id).await.unwrap();
            if current.status.is_terminal() {
                assert_eq!(current.status, DeploymentStatus::Live);
                assert!(current.url.is_some());
                assert_eq!(events.live.load(Ordering::SeqCst), 1);
                return;
            }
        }
        panic!("deployment never reached a terminal status");
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected_before_any_row_is_created() {
        let (orchestrator, _events) = test_orchestrator(StaticDriver::default()).await;
        let err = orchestrator
            .start(StartRequest {
                project_id: "proj-1".into(),
                user_id: "user-1".into(),
                provider: "does-not-exist".into(),
                environment: "production".into(),
                branch: "main".into(),
                user_plan: BuildPlan::default(),
                privileged: false,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn cancel_mid_build_lands_on_cancelled() {
        let (orchestrator, events) = test_orchestrator(StaticDriver::slow(StdDuration::from_secs(5))).await;
        let deployment = orchestrator
            .start(StartRequest {
                project_id: "proj-1".into(),
                user_id: "user-1".into(),
                provider: "static-v1".into(),
                environment: "production".into(),
                branch: "main".into(),
                user_plan: BuildPlan::default(),
                privileged: false,
            })
            .await
            .unwrap();

        // Give the task time to reach `deploying` before cancelling.
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        orchestrator.cancel(deployment.id).await.unwrap();

        for _ in 0..100 {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            let current = orchestrator.status(deployment.id).await.unwrap();
            if current.status.is_terminal() {
                assert_eq!(current.status, DeploymentStatus::Cancelled);
                assert_eq!(events.cancelled.load(Ordering::SeqCst), 1);
                return;
            }
        }
        panic!("cancelled deployment never reached a terminal status");
    }

    #[tokio::test]
    async fn driver_panic_is_finalized_as_failed_internal_error() {
        let (orchestrator, events) = test_orchestrator(StaticDriver::panicking()).await;
        let deployment = orchestrator
            .start(StartRequest {
                project_id: "proj-1".into(),
                user_id: "user-1".into(),
                provider: "static-v1".into(),
                environment: "production".into(),
                branch: "main".into(),
                user_plan: BuildPlan::default(),
                privileged: false,
            })
            .await
            .unwrap();

        for _ in 0..50 {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            let current = orchestrator.status(deployment.id).await.unwrap();
            if current.status.is_terminal() {
                assert_eq!(current.status, DeploymentStatus::Failed);
                assert!(current.error_message.unwrap().contains("panicked"));
                assert_eq!(events.failed.load(Ordering::SeqCst), 1);
                assert_eq!(events.internal_errors.load(Ordering::SeqCst), 1);
                return;
            }
        }
        panic!("panicked deployment never reached a terminal status");
    }

    #[tokio::test]
    async fn cancel_after_terminal_is_already_terminal() {
        let (orchestrator, _events) = test_orchestrator(StaticDriver::default()).await;
        let deployment = orchestrator
            .start(StartRequest {
                project_id: "proj-1".into(),
                user_id: "user-1".into(),
                provider: "static-v1".into(),
                environment: "production".into(),
                branch: "main".into(),
                user_plan: BuildPlan::default(),
                privileged: false,
            })
            .await
            .unwrap();

        loop {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            if orchestrator.status(deployment.id).await.unwrap().status.is_terminal() {
                break;
            }
        }

        let err = orchestrator.cancel(deployment.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyTerminal);
    }

    #[tokio::test]
    async fn redeploy_rejects_mismatched_owner() {
        let (orchestrator, _events) = test_orchestrator(StaticDriver::default()).await;
        let deployment = orchestrator
            .start(StartRequest {
                project_id: "proj-1".into(),
                user_id: "owner".into(),
                provider: "static-v1".into(),
                environment: "production".into(),
                branch: "main".into(),
                user_plan: BuildPlan::default(),
                privileged: false,
            })
            .await
            .unwrap();

        let err = orchestrator.redeploy(deployment.id, "someone-else", false).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn recover_stale_deployments_fails_rows_left_running_by_a_prior_process() {
        let (orchestrator, events) = test_orchestrator(StaticDriver::slow(StdDuration::from_secs(60))).await;
        let deployment = orchestrator
            .start(StartRequest {
                project_id: "proj-1".into(),
                user_id: "owner".into(),
                provider: "static-v1".into(),
                environment: "production".into(),
                branch: "main".into(),
                user_plan: BuildPlan::default(),
                privileged: false,
            })
            .await
            .unwrap();
        // Give the background task a moment to land in a non-terminal state
        // without actually reaching it — simulates the process dying mid-deploy.
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        let recovered = orchestrator.recover_stale_deployments().await.unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(events.internal_errors.load(Ordering::SeqCst), 1);

        let after = orchestrator.status(deployment.id).await.unwrap();
        assert_eq!(after.status, DeploymentStatus::Failed);
        assert!(after.error_message.unwrap().contains("process restarted"));
    }
}
