// SPDX-License-Identifier: MIT
//! C6/C9 — public REST API server.
//!
//! Axum HTTP server bridging the HTTP surface of source spec §6 into the
//! orchestrator's C7 operations, following the daemon's `rest/mod.rs` +
//! `rest/routes/` split: one thin route module per resource, a shared
//! `AppState` extracted via `State`, errors translated at the boundary
//! rather than threaded through as HTTP types.

pub mod error;
pub mod routes;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::deployment::Orchestrator;

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = AppState { orchestrator };

    Router::new()
        .route("/health", get(routes::health::health))
        .route("/deployment-providers", get(routes::providers::list_providers))
        .route(
            "/deployments",
            post(routes::deployments::create_deployment),
        )
        .route(
            "/deployments/{id}",
            get(routes::deployments::get_deployment),
        )
        .route(
            "/deployments/{id}/cancel",
            post(routes::deployments::cancel_deployment),
        )
        .route(
            "/deployments/{id}/logs",
            get(routes::deployments::get_deployment_logs),
        )
        .route(
            "/deployments/{id}/redeploy",
            post(routes::deployments::redeploy_deployment),
        )
        .route(
            "/projects/{id}/deployments",
            get(routes::deployments::list_project_deployments),
        )
        .with_state(state)
}

pub async fn start_rest_server(orchestrator: Arc<Orchestrator>, bind: std::net::SocketAddr) -> anyhow::Result<()> {
    let router = build_router(orchestrator);
    tracing::info!(%bind, "orchestrator REST API listening");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
