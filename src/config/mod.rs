// SPDX-License-Identifier: MIT
//! Configuration layer: CLI flag > environment variable > TOML file >
//! built-in default, the same priority chain the daemon's own config loader
//! uses.
//!
//! Provider tokens resolved here are handed to driver constructors as plain
//! parameters — the core orchestrator never reads the environment itself
//! (source spec §6).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

pub const DEFAULT_PORT: u16 = 8900;
pub const DEFAULT_MAX_CONCURRENT_DEPLOYMENTS: usize = 50;
pub const DEFAULT_STALL_SWEEP_INTERVAL_SECS: u64 = 60;
pub const ORCHESTRATOR_BUDGET_SECS: u64 = 30 * 60;
pub const STALL_SWEEP_GRACE_SECS: u64 = 5 * 60;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderProfile {
    pub base_url: Option<String>,
    pub token: Option<String>,
}

/// Shape of `orchd.toml`. Every field optional — only fields present
/// override the built-in default.
#[derive(Debug, Default, Deserialize)]
pub struct TomlConfig {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub log: Option<String>,
    pub max_concurrent_deployments: Option<usize>,
    pub stall_sweep_interval_secs: Option<u64>,
    /// Directory holding one subdirectory per `project_id`, read by the
    /// production [`crate::snapshot::DirectorySnapshotReader`]. Unset means
    /// no real project snapshots are available — only fine for `doctor` or
    /// for a deployment of a driver that doesn't need one.
    pub snapshots_dir: Option<PathBuf>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderProfile>,
}

pub fn load_toml(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        return Ok(TomlConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
}

/// Fully resolved configuration used for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    pub log_file: Option<PathBuf>,
    pub max_concurrent_deployments: usize,
    pub stall_sweep_interval_secs: u64,
    pub snapshots_dir: Option<PathBuf>,
    pub providers: HashMap<String, ProviderProfile>,
}

impl OrchestratorConfig {
    /// Resolve CLI args over a loaded TOML file over built-in defaults.
    #[allow(clippy::too_many_arguments)]
    pub fn resolve(
        cli_port: Option<u16>,
        cli_data_dir: Option<PathBuf>,
        cli_log: Option<String>,
        cli_log_file: Option<PathBuf>,
        cli_snapshots_dir: Option<PathBuf>,
        toml: TomlConfig,
    ) -> Self {
        Self {
            port: cli_port.or(toml.port).unwrap_or(DEFAULT_PORT),
            data_dir: cli_data_dir
                .or(toml.data_dir)
                .unwrap_or_else(default_data_dir),
            log: cli_log.or(toml.log).unwrap_or_else(|| "info".to_string()),
            log_file: cli_log_file,
            max_concurrent_deployments: toml
                .max_concurrent_deployments
                .unwrap_or(DEFAULT_MAX_CONCURRENT_DEPLOYMENTS),
            stall_sweep_interval_secs: toml
                .stall_sweep_interval_secs
                .unwrap_or(DEFAULT_STALL_SWEEP_INTERVAL_SECS),
            snapshots_dir: cli_snapshots_dir.or(toml.snapshots_dir),
            providers: toml.providers,
        }
    }

    pub fn provider_profile(&self, tag: &str) -> Option<&ProviderProfile> {
        self.providers.get(tag)
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        dirs_data_dir().join("Library/Application Support/orchd")
    }
    #[cfg(target_os = "linux")]
    {
        dirs_data_dir().join(".local/share/orchd")
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(dirs_data_dir)
            .join("orchd")
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        dirs_data_dir().join(".orchd")
    }
}

fn dirs_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Subset of config that may change without a process restart.
#[derive(Debug, Clone)]
pub struct HotConfig {
    pub log_level: String,
    pub stall_sweep_interval_secs: u64,
}

pub type SharedHotConfig = Arc<RwLock<HotConfig>>;

/// Watches `data_dir` (not the config file directly — watching a path that
/// does not yet exist fails on some platforms) and reloads the hot subset on
/// change, debounced.
pub struct ConfigWatcher {
    pub hot: SharedHotConfig,
    _watcher: notify_debouncer_full::Debouncer<
        notify::RecommendedWatcher,
        notify_debouncer_full::RecommendedCache,
    >,
}

impl ConfigWatcher {
    pub fn start(config_path: PathBuf, initial: HotConfig) -> Result<Self> {
        use notify::RecursiveMode;
        use notify_debouncer_full::{new_debouncer, DebounceEventResult};

        let hot = Arc::new(RwLock::new(initial));
        let hot_for_watcher = hot.clone();
        let rt_handle = tokio::runtime::Handle::try_current().ok();
        let watch_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut debouncer = new_debouncer(
            std::time::Duration::from_secs(2),
            None,
            move |result: DebounceEventResult| {
                if result.is_err() {
                    return;
                }
                let Ok(toml_cfg) = load_toml(&config_path) else {
                    return;
                };
                let hot_for_task = hot_for_watcher.clone();
                let apply = async move {
                    let mut guard = hot_for_task.write().await;
                    if let Some(level) = toml_cfg.log {
                        guard.log_level = level;
                    }
                    if let Some(secs) = toml_cfg.stall_sweep_interval_secs {
                        guard.stall_sweep_interval_secs = secs;
                    }
                    tracing::info!("hot config reloaded");
                };
                if let Some(handle) = &rt_handle {
                    handle.spawn(apply);
                }
            },
        )?;
        debouncer.watch(&watch_dir, RecursiveMode::NonRecursive)?;

        Ok(Self {
            hot,
            _watcher: debouncer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_toml_overrides_builtin_default() {
        let toml = TomlConfig {
            port: Some(9000),
            max_concurrent_deployments: Some(10),
            ..Default::default()
        };
        let resolved = OrchestratorConfig::resolve(Some(9100), None, None, None, None, toml);
        assert_eq!(resolved.port, 9100);
        assert_eq!(resolved.max_concurrent_deployments, 10);
        assert_eq!(resolved.stall_sweep_interval_secs, DEFAULT_STALL_SWEEP_INTERVAL_SECS);
    }

    #[test]
    fn provider_profile_looks_up_by_tag() {
        let mut providers = HashMap::new();
        providers.insert(
            "content-digest".to_string(),
            ProviderProfile {
                base_url: Some("https://example.test".to_string()),
                token: Some("tok".to_string()),
            },
        );
        let toml = TomlConfig {
            providers,
            ..Default::default()
        };
        let resolved = OrchestratorConfig::resolve(None, None, None, None, None, toml);
        assert_eq!(
            resolved.provider_profile("content-digest").unwrap().base_url.as_deref(),
            Some("https://example.test")
        );
        assert!(resolved.provider_profile("unknown").is_none());
    }

    #[tokio::test]
    async fn config_watcher_picks_up_stall_interval_change() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("orchd.toml");
        std::fs::write(&config_path, "stall_sweep_interval_secs = 60\n").unwrap();

        let watcher = ConfigWatcher::start(
            config_path.clone(),
            HotConfig {
                log_level: "info".to_string(),
                stall_sweep_interval_secs: 60,
            },
        )
        .unwrap();

        std::fs::write(&config_path, "stall_sweep_interval_secs = 5\n").unwrap();

        let mut reloaded = false;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            if watcher.hot.read().await.stall_sweep_interval_secs == 5 {
                reloaded = true;
                break;
            }
        }
        assert!(reloaded, "hot config was never reloaded after the file changed");
    }
}
