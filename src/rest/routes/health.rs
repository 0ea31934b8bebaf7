// SPDX-License-Identifier: MIT
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::rest::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": state.orchestrator.registered_providers(),
    }))
}
