// SPDX-License-Identifier: MIT
//! Deployment orchestrator library crate: wires C1–C9 together behind one
//! [`AppContext`], the same role the daemon's own `AppContext` plays for its
//! RPC handlers and background tasks.

pub mod circuit_breaker;
pub mod config;
pub mod deployment;
pub mod drivers;
pub mod error;
pub mod events;
pub mod logging;
pub mod mcp;
pub mod packager;
pub mod planner;
pub mod rest;
pub mod retry;
pub mod snapshot;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use config::OrchestratorConfig;
use deployment::{LogStream, Orchestrator, Storage};
use drivers::content_digest::{ContentDigestDriver, ReqwestContentDigestBackend};
use drivers::native::{LocalProcessContainerHost, NativeDriver};
use drivers::ProviderDriver;
use events::{EventSink, TracingEventSink};
use mcp::McpPool;
use snapshot::{DirectorySnapshotReader, InMemorySnapshotReader, PolicyFilteringReader, SnapshotReader};

/// Shared application state handed to the REST layer and background tasks.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<OrchestratorConfig>,
    pub orchestrator: Arc<Orchestrator>,
    pub mcp_pool: Arc<McpPool>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    /// Construct the full dependency graph: storage, log stream, driver
    /// registry, snapshot reader, event sink, orchestrator.
    pub async fn bootstrap(config: OrchestratorConfig) -> Result<Self> {
        let storage = Arc::new(Storage::new(&config.data_dir).await?);
        let logs = Arc::new(LogStream::new(storage.pool().clone()));
        let snapshots: Arc<dyn SnapshotReader> = match &config.snapshots_dir {
            Some(dir) => Arc::new(PolicyFilteringReader::new(DirectorySnapshotReader::new(dir.clone()))),
            None => Arc::new(PolicyFilteringReader::new(InMemorySnapshotReader::new())),
        };
        let events: Arc<dyn EventSink> = Arc::new(TracingEventSink);

        let drivers = build_driver_registry(&config, events.clone());

        let orchestrator = Arc::new(Orchestrator::new(storage, logs, snapshots, drivers, events));

        Ok(Self {
            config: Arc::new(config),
            orchestrator,
            mcp_pool: Arc::new(McpPool::new()),
            started_at: std::time::Instant::now(),
        })
    }
}

/// `static-v1` is deliberately absent here: it's a deterministic fake used
/// by the end-to-end test scenarios, not a real back-end (see
/// `drivers::static_driver`'s doc comment).
fn build_driver_registry(
    config: &OrchestratorConfig,
    events: Arc<dyn EventSink>,
) -> HashMap<String, Arc<dyn ProviderDriver>> {
    let mut drivers: HashMap<String, Arc<dyn ProviderDriver>> = HashMap::new();

    let digest_profile = config.provider_profile("content-digest");
    drivers.insert(
        "content-digest-v1".to_string(),
        Arc::new(ContentDigestDriver::new(
            "content-digest-v1",
            ReqwestContentDigestBackend::new(
                digest_profile.and_then(|p| p.base_url.clone()).unwrap_or_default(),
                digest_profile.and_then(|p| p.token.clone()).unwrap_or_default(),
            ),
            events,
        )),
    );

    drivers.insert(
        "native".to_string(),
        Arc::new(NativeDriver::new(LocalProcessContainerHost {
            scratch_root: config.data_dir.join("native-scratch"),
        })),
    );

    drivers
}
