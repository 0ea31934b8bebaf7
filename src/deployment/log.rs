// SPDX-License-Identifier: MIT
//! C6 — Log Stream. Append-only, per-deployment, phase-tagged.

use crate::deployment::model::{DeploymentLog, LogLevel, Phase};
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
struct LogRow {
    deployment_id: String,
    seq: i64,
    timestamp: String,
    level: String,
    phase: String,
    message: String,
    metadata: Option<String>,
}

impl LogRow {
    fn into_model(self) -> Result<DeploymentLog> {
        Ok(DeploymentLog {
            deployment_id: Uuid::parse_str(&self.deployment_id)?,
            seq: self.seq,
            timestamp: chrono::DateTime::parse_from_rfc3339(&self.timestamp)?.with_timezone(&Utc),
            level: LogLevel::from_str(&self.level).map_err(anyhow::Error::msg)?,
            phase: Phase::from_str(&self.phase).unwrap(),
            message: self.message,
            metadata: self.metadata.map(|m| serde_json::from_str(&m)).transpose()?,
        })
    }
}

pub struct LogStream {
    pool: SqlitePool,
}

impl LogStream {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one entry.
    ///
    /// When `caller_seq` is `None` the sequence number is store-assigned:
    /// one greater than the highest existing sequence for this deployment,
    /// computed and inserted inside a single transaction so concurrent
    /// appends (there are none today — only C7's owning task appends — but
    /// the seam is kept transaction-safe) cannot collide.
    ///
    /// When `caller_seq` is `Some`, the insert is idempotent on
    /// `(deployment_id, seq)`: a driver that retries after a transient
    /// failure and re-emits a line it already reported once lands a
    /// `DO NOTHING` no-op instead of a duplicate row, and `append` returns
    /// the caller's own sequence number either way.
    pub async fn append(
        &self,
        deployment_id: Uuid,
        level: LogLevel,
        phase: Phase,
        message: impl Into<String>,
        metadata: Option<serde_json::Value>,
        caller_seq: Option<i64>,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let seq = match caller_seq {
            Some(seq) => seq,
            None => {
                sqlx::query(
                    "SELECT COALESCE(MAX(seq), 0) + 1 as next_seq FROM deployment_logs WHERE deployment_id = ?",
                )
                .bind(deployment_id.to_string())
                .fetch_one(&mut *tx)
                .await?
                .try_get("next_seq")?
            }
        };

        sqlx::query(
            "INSERT INTO deployment_logs (deployment_id, seq, timestamp, level, phase, message, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (deployment_id, seq) DO NOTHING",
        )
        .bind(deployment_id.to_string())
        .bind(seq)
        .bind(Utc::now().to_rfc3339())
        .bind(level.as_str())
        .bind(phase.as_str())
        .bind(message.into())
        .bind(metadata.map(|m| m.to_string()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(seq)
    }

    /// Entries strictly greater than `since_seq`, in append order.
    pub async fn tail(
        &self,
        deployment_id: Uuid,
        since_seq: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<DeploymentLog>> {
        let since = since_seq.unwrap_or(0);
        let limit = limit.unwrap_or(500).clamp(1, 2000);
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT * FROM deployment_logs WHERE deployment_id = ? AND seq > ?
             ORDER BY seq ASC LIMIT ?",
        )
        .bind(deployment_id.to_string())
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(LogRow::into_model)
            .collect::<Result<Vec<_>>>()
            .context("decoding deployment log row")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::store::Storage;

    async fn test_pool() -> SqlitePool {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(Box::leak(Box::new(dir)).path()).await.unwrap();
        storage.pool().clone()
    }

    #[tokio::test]
    async fn append_then_tail_returns_in_order() {
        let pool = test_pool().await;
        let deployment_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO deployments (id, project_id, user_id, provider, status, environment, branch, started_at, config_snapshot, provider_metadata)
             VALUES (?, 'p', 'u', 'static-v1', 'pending', 'production', 'main', ?, '{}', '{}')",
        )
        .bind(deployment_id.to_string())
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .unwrap();

        let stream = LogStream::new(pool);
        stream
            .append(deployment_id, LogLevel::Info, Phase::Prepare, "starting", None, None)
            .await
            .unwrap();
        stream
            .append(deployment_id, LogLevel::Info, Phase::Build, "building", None, None)
            .await
            .unwrap();

        let entries = stream.tail(deployment_id, None, None).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "starting");
        assert_eq!(entries[1].message, "building");

        let since_first = stream.tail(deployment_id, Some(entries[0].seq), None).await.unwrap();
        assert_eq!(since_first.len(), 1);
        assert_eq!(since_first[0].message, "building");
    }

    #[tokio::test]
    async fn caller_supplied_seq_is_idempotent_on_retry() {
        let pool = test_pool().await;
        let deployment_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO deployments (id, project_id, user_id, provider, status, environment, branch, started_at, config_snapshot, provider_metadata)
             VALUES (?, 'p', 'u', 'static-v1', 'pending', 'production', 'main', ?, '{}', '{}')",
        )
        .bind(deployment_id.to_string())
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .unwrap();

        let stream = LogStream::new(pool);
        let first =
            stream.append(deployment_id, LogLevel::Info, Phase::Deploy, "upload retried", None, Some(7)).await.unwrap();
        // A driver retry re-emits the same line under the same caller seq
        // after its own transient failure; this must not create a second row.
        let second =
            stream.append(deployment_id, LogLevel::Info, Phase::Deploy, "upload retried", None, Some(7)).await.unwrap();
        assert_eq!(first, 7);
        assert_eq!(second, 7);

        let entries = stream.tail(deployment_id, None, None).await.unwrap();
        assert_eq!(entries.len(), 1);
    }
}
