// SPDX-License-Identifier: MIT
//! `static-v1` — the fake driver used by the happy-path, cancellation, and
//! config-rejection end-to-end scenarios. Not wired into production
//! configuration; exported for tests and for local `doctor`-style smoke
//! checks.

use super::tokio_util_cancel::CancelToken;
use super::{PollPolicy, ProviderDriver, ProviderResult};
use crate::deployment::model::DeploymentStatus;
use crate::error::{ErrorKind, OrchestratorError};
use crate::packager::Package;
use crate::planner::BuildPlan;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    polls: HashMap<String, u32>,
    cancelled: HashSet<String>,
    last_package_paths: Vec<String>,
}

pub struct StaticDriver {
    /// When true, `validate_config` always rejects (scenario 3).
    pub reject_config: bool,
    /// Delay before the first status transition out of `deploying`,
    /// cancellable — used by the mid-build cancellation scenario.
    pub first_poll_delay: Duration,
    /// How many `get_status` calls before the deployment goes live.
    pub polls_until_live: u32,
    /// When true, `deploy` panics instead of returning — used to exercise
    /// the orchestrator's panic-supervision path.
    pub panic_on_deploy: bool,
    state: Arc<Mutex<State>>,
}

impl Default for StaticDriver {
    fn default() -> Self {
        Self {
            reject_config: false,
            first_poll_delay: Duration::ZERO,
            polls_until_live: 2,
            panic_on_deploy: false,
            state: Arc::new(Mutex::new(State::default())),
        }
    }
}

impl StaticDriver {
    pub fn rejecting() -> Self {
        Self {
            reject_config: true,
            ..Self::default()
        }
    }

    pub fn slow(first_poll_delay: Duration) -> Self {
        Self {
            first_poll_delay,
            ..Self::default()
        }
    }

    pub fn panicking() -> Self {
        Self {
            panic_on_deploy: true,
            ..Self::default()
        }
    }

    pub async fn was_cancelled(&self, provider_id: &str) -> bool {
        self.state.lock().await.cancelled.contains(provider_id)
    }

    /// Paths of the package handed to the most recent `deploy` call, in
    /// iteration order — lets a test assert on what actually reached the
    /// driver (e.g. that a `protected` file was filtered upstream).
    pub async fn last_package_paths(&self) -> Vec<String> {
        self.state.lock().await.last_package_paths.clone()
    }
}

#[async_trait]
impl ProviderDriver for StaticDriver {
    fn name(&self) -> &'static str {
        "static-v1"
    }

    async fn validate_config(&self, _plan: &BuildPlan) -> Result<(), OrchestratorError> {
        if self.reject_config {
            return Err(OrchestratorError::new(
                ErrorKind::InvalidConfig,
                "static-v1 test driver configured to reject all plans",
            ));
        }
        Ok(())
    }

    async fn deploy(
        &self,
        _plan: &BuildPlan,
        package: &Package,
        cancel: CancelToken,
    ) -> Result<ProviderResult, OrchestratorError> {
        if self.panic_on_deploy {
            panic!("static-v1 test driver configured to panic on deploy");
        }
        let provider_id = Uuid::new_v4().to_string();
        {
            let mut state = self.state.lock().await;
            state.polls.insert(provider_id.clone(), 0);
            state.last_package_paths = package.content_by_path.keys().cloned().collect();
        }

        if !self.first_poll_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.first_poll_delay) => {}
                _ = cancel.cancelled() => {
                    self.state.lock().await.cancelled.insert(provider_id.clone());
                    return Err(OrchestratorError::new(ErrorKind::Cancelled, "cancelled before first poll"));
                }
            }
        }

        Ok(ProviderResult {
            provider_id,
            status: DeploymentStatus::Deploying,
            url: None,
            preview_url: None,
            log_lines: vec!["static-v1: deploy accepted".to_string()],
            error: None,
        })
    }

    async fn get_status(&self, provider_id: &str) -> Result<ProviderResult, OrchestratorError> {
        let mut state = self.state.lock().await;
        if state.cancelled.contains(provider_id) {
            return Err(OrchestratorError::new(ErrorKind::Cancelled, "deployment was cancelled"));
        }
        let count = state.polls.entry(provider_id.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.polls_until_live {
            Ok(ProviderResult {
                provider_id: provider_id.to_string(),
                status: DeploymentStatus::Live,
                url: Some(format!("https://fake.example/{provider_id}")),
                preview_url: Some(format!("https://preview-{provider_id}.fake.example")),
                log_lines: vec!["static-v1: now live".to_string()],
                error: None,
            })
        } else {
            Ok(ProviderResult {
                provider_id: provider_id.to_string(),
                status: DeploymentStatus::Deploying,
                url: None,
                preview_url: None,
                log_lines: vec![],
                error: None,
            })
        }
    }

    async fn cancel(&self, provider_id: &str) -> Result<(), OrchestratorError> {
        let mut state = self.state.lock().await;
        if !state.polls.contains_key(provider_id) {
            return Err(OrchestratorError::already_terminal(
                "static-v1: unknown or already-terminal provider id",
            ));
        }
        state.cancelled.insert(provider_id.to_string());
        Ok(())
    }

    async fn get_logs(&self, _provider_id: &str) -> Result<Vec<String>, OrchestratorError> {
        Ok(vec!["static-v1: deploy accepted".to_string(), "static-v1: now live".to_string()])
    }

    fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(50),
            budget: Duration::from_secs(5),
        }
    }
}
