// SPDX-License-Identifier: MIT
//! `native` driver — the internal container host mentioned in source spec
//! §1 as one of the in-scope back-ends alongside the external providers.
//! This driver *drives* a container host, it does not implement one (source
//! spec's explicit Non-goal): the actual process/container lifecycle lives
//! behind [`ContainerHost`], the same backend-seam idiom as
//! [`super::content_digest::ContentDigestBackend`].

use super::tokio_util_cancel::CancelToken;
use super::{PollPolicy, ProviderDriver, ProviderResult};
use crate::deployment::model::DeploymentStatus;
use crate::error::{ErrorKind, OrchestratorError};
use crate::packager::Package;
use crate::planner::BuildPlan;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Starting,
    Running,
    Exited { success: bool },
}

#[async_trait]
pub trait ContainerHost: Send + Sync {
    async fn start(&self, plan: &BuildPlan, package: &Package) -> Result<String, OrchestratorError>;
    async fn status(&self, handle_id: &str) -> Result<ContainerStatus, OrchestratorError>;
    async fn stop(&self, handle_id: &str) -> Result<(), OrchestratorError>;
    async fn logs(&self, handle_id: &str) -> Result<Vec<String>, OrchestratorError>;
}

pub struct NativeDriver<H: ContainerHost> {
    host: H,
}

impl<H: ContainerHost> NativeDriver<H> {
    pub fn new(host: H) -> Self {
        Self { host }
    }
}

#[async_trait]
impl<H: ContainerHost + Send + Sync> ProviderDriver for NativeDriver<H> {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn validate_config(&self, plan: &BuildPlan) -> Result<(), OrchestratorError> {
        if plan.build_cmd.is_none() {
            return Err(OrchestratorError::new(
                ErrorKind::InvalidConfig,
                "native driver requires a resolved build_cmd",
            ));
        }
        Ok(())
    }

    async fn deploy(
        &self,
        plan: &BuildPlan,
        package: &Package,
        _cancel: CancelToken,
    ) -> Result<ProviderResult, OrchestratorError> {
        let handle_id = self.host.start(plan, package).await?;
        Ok(ProviderResult {
            provider_id: handle_id,
            status: DeploymentStatus::Deploying,
            url: None,
            preview_url: None,
            log_lines: vec!["native: container starting".to_string()],
            error: None,
        })
    }

    async fn get_status(&self, provider_id: &str) -> Result<ProviderResult, OrchestratorError> {
        let status = self.host.status(provider_id).await?;
        Ok(match status {
            ContainerStatus::Starting => ProviderResult {
                provider_id: provider_id.to_string(),
                status: DeploymentStatus::Deploying,
                url: None,
                preview_url: None,
                log_lines: vec![],
                error: None,
            },
            ContainerStatus::Running => ProviderResult {
                provider_id: provider_id.to_string(),
                status: DeploymentStatus::Live,
                url: Some(format!("http://localhost/{provider_id}")),
                preview_url: None,
                log_lines: vec![],
                error: None,
            },
            ContainerStatus::Exited { success: true } => ProviderResult {
                provider_id: provider_id.to_string(),
                status: DeploymentStatus::Live,
                url: Some(format!("http://localhost/{provider_id}")),
                preview_url: None,
                log_lines: vec![],
                error: None,
            },
            ContainerStatus::Exited { success: false } => ProviderResult {
                provider_id: provider_id.to_string(),
                status: DeploymentStatus::Failed,
                url: None,
                preview_url: None,
                log_lines: vec![],
                error: Some(OrchestratorError::new(
                    ErrorKind::ProviderRejected,
                    "native: build/run process exited non-zero",
                )),
            },
        })
    }

    async fn cancel(&self, provider_id: &str) -> Result<(), OrchestratorError> {
        self.host.stop(provider_id).await
    }

    async fn get_logs(&self, provider_id: &str) -> Result<Vec<String>, OrchestratorError> {
        self.host.logs(provider_id).await
    }

    fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: std::time::Duration::from_secs(2),
            budget: std::time::Duration::from_secs(10 * 60),
        }
    }
}

/// Runs `install_cmd` then `build_cmd` as local child processes in a
/// per-deployment scratch directory. Does not implement an actual container
/// sandbox or long-running serve step — per source spec's Non-goal, this
/// crate drives a runtime, it is not one.
pub struct LocalProcessContainerHost {
    pub scratch_root: PathBuf,
}

#[async_trait]
impl ContainerHost for LocalProcessContainerHost {
    async fn start(&self, plan: &BuildPlan, package: &Package) -> Result<String, OrchestratorError> {
        let handle_id = uuid::Uuid::new_v4().to_string();
        let workdir = self.scratch_root.join(&handle_id);
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| OrchestratorError::new(ErrorKind::InternalError, e.to_string()))?;

        for (path, bytes) in &package.content_by_path {
            let dest = workdir.join(path);
            if let Some(parent) = dest.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            let mut file = tokio::fs::File::create(&dest)
                .await
                .map_err(|e| OrchestratorError::new(ErrorKind::InternalError, e.to_string()))?;
            file.write_all(bytes)
                .await
                .map_err(|e| OrchestratorError::new(ErrorKind::InternalError, e.to_string()))?;
        }

        if let Some(install_cmd) = plan.install_cmd.as_deref().filter(|c| !c.is_empty()) {
            run_shell(install_cmd, &workdir).await?;
        }
        if let Some(build_cmd) = plan.build_cmd.as_deref().filter(|c| !c.is_empty()) {
            run_shell(build_cmd, &workdir).await?;
        }

        Ok(handle_id)
    }

    async fn status(&self, _handle_id: &str) -> Result<ContainerStatus, OrchestratorError> {
        // The build ran synchronously in `start`; by the time a caller asks
        // for status the workload is already up.
        Ok(ContainerStatus::Running)
    }

    async fn stop(&self, handle_id: &str) -> Result<(), OrchestratorError> {
        let workdir = self.scratch_root.join(handle_id);
        let _ = tokio::fs::remove_dir_all(&workdir).await;
        Ok(())
    }

    async fn logs(&self, _handle_id: &str) -> Result<Vec<String>, OrchestratorError> {
        Ok(vec!["native: see process stdout/stderr capture".to_string()])
    }
}

async fn run_shell(cmd: &str, workdir: &std::path::Path) -> Result<(), OrchestratorError> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(workdir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| OrchestratorError::new(ErrorKind::ProviderUnreachable, e.to_string()))?;

    if !output.status.success() {
        return Err(OrchestratorError::new(
            ErrorKind::ProviderRejected,
            format!("`{cmd}` exited with {}", output.status),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::tokio_util_cancel;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn plan() -> BuildPlan {
        BuildPlan {
            framework: Some("static".into()),
            install_cmd: None,
            build_cmd: Some("true".into()),
            output_dir: None,
            service_type: None,
            runtime_version: None,
        }
    }

    fn package() -> Package {
        let mut content_by_path = BTreeMap::new();
        content_by_path.insert("index.html".to_string(), b"<h1>hi</h1>".to_vec());
        Package {
            digest_by_path: BTreeMap::new(),
            content_by_path,
        }
    }

    #[tokio::test]
    async fn validate_config_rejects_missing_build_cmd() {
        let driver = NativeDriver::new(LocalProcessContainerHost {
            scratch_root: std::env::temp_dir(),
        });
        let mut bad_plan = plan();
        bad_plan.build_cmd = None;
        let err = driver.validate_config(&bad_plan).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn local_process_host_writes_files_and_runs_build() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalProcessContainerHost {
            scratch_root: dir.path().to_path_buf(),
        };
        let handle_id = host.start(&plan(), &package()).await.unwrap();
        let written = dir.path().join(&handle_id).join("index.html");
        assert!(written.exists());

        assert_eq!(host.status(&handle_id).await.unwrap(), ContainerStatus::Running);
        host.stop(&handle_id).await.unwrap();
        assert!(!dir.path().join(&handle_id).exists());
    }

    #[tokio::test]
    async fn local_process_host_surfaces_build_failure() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalProcessContainerHost {
            scratch_root: dir.path().to_path_buf(),
        };
        let mut failing_plan = plan();
        failing_plan.build_cmd = Some("false".into());
        let err = host.start(&failing_plan, &package()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProviderRejected);
    }

    struct FakeHost {
        status: ContainerStatus,
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ContainerHost for FakeHost {
        async fn start(&self, _plan: &BuildPlan, _package: &Package) -> Result<String, OrchestratorError> {
            Ok("handle-1".to_string())
        }

        async fn status(&self, _handle_id: &str) -> Result<ContainerStatus, OrchestratorError> {
            Ok(self.status)
        }

        async fn stop(&self, _handle_id: &str) -> Result<(), OrchestratorError> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn logs(&self, _handle_id: &str) -> Result<Vec<String>, OrchestratorError> {
            Ok(vec!["fake log line".to_string()])
        }
    }

    #[tokio::test]
    async fn get_status_maps_running_to_live_with_url() {
        let stopped = Arc::new(AtomicBool::new(false));
        let driver = NativeDriver::new(FakeHost {
            status: ContainerStatus::Running,
            stopped: stopped.clone(),
        });

        let (_source, cancel) = tokio_util_cancel::channel();
        let deployed = driver.deploy(&plan(), &package(), cancel).await.unwrap();
        assert_eq!(deployed.status, DeploymentStatus::Deploying);

        let result = driver.get_status(&deployed.provider_id).await.unwrap();
        assert_eq!(result.status, DeploymentStatus::Live);
        assert!(result.url.is_some());

        driver.cancel(&deployed.provider_id).await.unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn get_status_maps_failed_exit_to_failed_with_error() {
        let driver = NativeDriver::new(FakeHost {
            status: ContainerStatus::Exited { success: false },
            stopped: Arc::new(AtomicBool::new(false)),
        });
        let result = driver.get_status("handle-1").await.unwrap();
        assert_eq!(result.status, DeploymentStatus::Failed);
        assert_eq!(result.error.unwrap().kind, ErrorKind::ProviderRejected);
    }
}
