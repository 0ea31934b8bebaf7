// SPDX-License-Identifier: MIT
use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::rest::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub features: &'static [&'static str],
}

/// Static catalog of the adapter kinds this binary knows how to build a
/// [`crate::drivers::ProviderDriver`] for; cross-checked at startup against
/// the orchestrator's actually-registered driver names so the two never
/// silently diverge.
const CATALOG: &[ProviderInfo] = &[
    ProviderInfo {
        id: "static-v1",
        name: "Static Hosting",
        description: "Synchronous upload of a static file bundle to a CDN-backed origin.",
        features: &["instant_deploy"],
    },
    ProviderInfo {
        id: "content-digest-v1",
        name: "Content-Digest CDN",
        description: "Per-file content-addressed upload with a digest manifest and async build polling.",
        features: &["preview_url", "incremental_upload", "build_logs"],
    },
    ProviderInfo {
        id: "native",
        name: "Native Runtime",
        description: "Runs the build and serves the workload on an internally managed container host.",
        features: &["build_logs"],
    },
];

pub async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderInfo>> {
    let registered = state.orchestrator.registered_providers();
    let providers = CATALOG
        .iter()
        .filter(|info| registered.contains(&info.id))
        .cloned()
        .collect();
    Json(providers)
}
