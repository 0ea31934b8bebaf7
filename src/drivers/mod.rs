// SPDX-License-Identifier: MIT
//! C4 — Provider Driver contract and adapters.
//!
//! Every adapter implements the same six operations (source spec §4.4). The
//! trait shape follows the daemon's `session::runner::Runner` — a small
//! async-trait seam for pluggable backends — generalized to the richer
//! deploy/status/cancel/logs/validate surface this domain needs.

pub mod content_digest;
pub mod native;
pub mod static_driver;

use crate::deployment::model::DeploymentStatus;
use crate::error::{ErrorKind, OrchestratorError};
use crate::packager::Package;
use crate::planner::BuildPlan;
use async_trait::async_trait;
use std::time::Duration;

/// Result of a `Deploy` or `GetStatus` call. `status` uses the same
/// seven-state vocabulary as [`DeploymentStatus`] — every adapter maps its
/// provider's native status vocabulary into this set; any status the
/// adapter hasn't listed as terminal must keep the orchestrator polling.
#[derive(Debug, Clone)]
pub struct ProviderResult {
    pub provider_id: String,
    pub status: DeploymentStatus,
    pub url: Option<String>,
    pub preview_url: Option<String>,
    pub log_lines: Vec<String>,
    pub error: Option<OrchestratorError>,
}

impl ProviderResult {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Poll interval and overall budget for a driver whose `Deploy` is
/// asynchronous (source spec §4.4's "status polling protocol").
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub budget: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            budget: Duration::from_secs(12 * 60),
        }
    }
}

#[async_trait]
pub trait ProviderDriver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn validate_config(&self, plan: &BuildPlan) -> Result<(), OrchestratorError>;

    async fn deploy(
        &self,
        plan: &BuildPlan,
        package: &Package,
        cancel: tokio_util_cancel::CancelToken,
    ) -> Result<ProviderResult, OrchestratorError>;

    async fn get_status(&self, provider_id: &str) -> Result<ProviderResult, OrchestratorError>;

    async fn cancel(&self, provider_id: &str) -> Result<(), OrchestratorError>;

    async fn get_logs(&self, provider_id: &str) -> Result<Vec<String>, OrchestratorError>;

    fn poll_policy(&self) -> PollPolicy {
        PollPolicy::default()
    }
}

/// Drive a driver's asynchronous `Deploy`/`GetStatus` pair through the fixed
/// polling protocol of source spec §4.4: poll until terminal, cancellation,
/// or budget exhaustion (→ `provider_timeout`).
pub async fn poll_until_terminal(
    driver: &dyn ProviderDriver,
    provider_id: &str,
    policy: PollPolicy,
    cancel: &tokio_util_cancel::CancelToken,
) -> Result<ProviderResult, OrchestratorError> {
    let deadline = tokio::time::Instant::now() + policy.budget;
    loop {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::new(ErrorKind::Cancelled, "cancelled while polling"));
        }
        let result = driver.get_status(provider_id).await?;
        if result.is_terminal() {
            return Ok(result);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(OrchestratorError::new(
                ErrorKind::ProviderTimeout,
                format!("{} polling budget exhausted", driver.name()),
            ));
        }
        tokio::select! {
            _ = tokio::time::sleep(policy.interval) => {}
            _ = cancel.cancelled() => {
                return Err(OrchestratorError::new(ErrorKind::Cancelled, "cancelled while polling"));
            }
        }
    }
}

/// Minimal cooperative-cancellation token, since this crate carries no
/// dependency on `tokio-util` for the single `CancellationToken` primitive
/// it would otherwise pull in — a thin wrapper over a broadcast-style
/// `tokio::sync::watch<bool>` gives the same "cheap clone, many observers,
/// one shot from false to true" shape.
pub mod tokio_util_cancel {
    use tokio::sync::watch;

    #[derive(Clone)]
    pub struct CancelToken {
        rx: watch::Receiver<bool>,
    }

    pub struct CancelSource {
        tx: watch::Sender<bool>,
    }

    pub fn channel() -> (CancelSource, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelSource { tx }, CancelToken { rx })
    }

    impl CancelSource {
        pub fn cancel(&self) {
            let _ = self.tx.send(true);
        }
    }

    impl CancelToken {
        pub fn is_cancelled(&self) -> bool {
            *self.rx.borrow()
        }

        /// Resolves once the token is cancelled.
        pub async fn cancelled(&self) {
            let mut rx = self.rx.clone();
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return; // source dropped without cancelling — never resolves again
                }
            }
        }
    }
}
