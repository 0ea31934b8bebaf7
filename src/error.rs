// SPDX-License-Identifier: MIT
//! The closed error-kind taxonomy surfaced by name in HTTP responses and in
//! the deployment log stream.
//!
//! Internal call sites use `anyhow::Result` and attach context as they
//! unwind; at the orchestrator/HTTP boundary, errors are classified into an
//! [`OrchestratorError`] the same way the daemon's `ipc` layer used to
//! classify anyhow markers into JSON-RPC codes — here the marker is the
//! variant itself, set by whichever layer first detects the failure mode.

use thiserror::Error;

/// One of the ten (plus `internal_error`) closed error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidConfig,
    InvalidSnapshot,
    ProviderUnreachable,
    ProviderRejected,
    ProviderTimeout,
    OrchestratorTimeout,
    Cancelled,
    AlreadyTerminal,
    NotFound,
    Unauthorized,
    InternalError,
}

impl ErrorKind {
    /// The `snake_case` name surfaced in the `code` field of HTTP error
    /// bodies and in `error_message` as `kind: detail`.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::InvalidSnapshot => "invalid_snapshot",
            ErrorKind::ProviderUnreachable => "provider_unreachable",
            ErrorKind::ProviderRejected => "provider_rejected",
            ErrorKind::ProviderTimeout => "provider_timeout",
            ErrorKind::OrchestratorTimeout => "orchestrator_timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::AlreadyTerminal => "already_terminal",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified, typed error crossing the orchestrator/HTTP boundary.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {detail}")]
pub struct OrchestratorError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl OrchestratorError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, detail)
    }

    pub fn already_terminal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyTerminal, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, detail)
    }

    pub fn invalid_config(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, detail)
    }

    /// Format as the `kind: detail` string persisted into
    /// `Deployment.error_message`.
    pub fn as_error_message(&self) -> String {
        format!("{}: {}", self.kind, self.detail)
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
