// SPDX-License-Identifier: MIT
//! Maps [`OrchestratorError`] to the `{code, message}` HTTP body shape of
//! source spec §7, with the status code the kind implies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::{ErrorKind, OrchestratorError};

pub struct ApiError(pub OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyTerminal => StatusCode::CONFLICT,
            ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
            ErrorKind::InvalidConfig | ErrorKind::InvalidSnapshot => StatusCode::BAD_REQUEST,
            ErrorKind::ProviderTimeout | ErrorKind::OrchestratorTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::ProviderUnreachable | ErrorKind::ProviderRejected => StatusCode::BAD_GATEWAY,
            ErrorKind::Cancelled => StatusCode::CONFLICT,
            ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "code": self.0.kind.as_str(),
            "message": self.0.detail,
        }));
        (status, body).into_response()
    }
}
