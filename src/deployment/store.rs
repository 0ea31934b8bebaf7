// SPDX-License-Identifier: MIT
//! C5 — Deployment State Machine, persisted.
//!
//! Grounded on the daemon's `storage/mod.rs`: WAL-mode SQLite, migrations run
//! via `include_str!`, `#[derive(sqlx::FromRow)]` row structs, and an atomic
//! `UPDATE ... WHERE status IN (...)` claim pattern so only the single owning
//! task for a deployment ID can ever advance its row (source spec §4.5/§5 —
//! "concurrent writers to the same deployment ID are prevented by
//! discipline... rather than row locks").

use crate::deployment::model::{Deployment, DeploymentStatus};
use crate::planner::BuildPlan;
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T, sqlx::Error>>) -> Result<T, sqlx::Error> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(sqlx::Error::PoolTimedOut),
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DeploymentRow {
    id: String,
    project_id: String,
    user_id: String,
    provider: String,
    status: String,
    environment: String,
    branch: String,
    url: Option<String>,
    preview_url: Option<String>,
    error_message: Option<String>,
    build_time_ms: Option<i64>,
    deploy_time_ms: Option<i64>,
    total_time_ms: Option<i64>,
    started_at: String,
    completed_at: Option<String>,
    config_snapshot: String,
    provider_metadata: String,
    deleted_at: Option<String>,
}

impl DeploymentRow {
    fn into_model(self) -> Result<Deployment> {
        Ok(Deployment {
            id: Uuid::parse_str(&self.id).context("invalid deployment id in row")?,
            project_id: self.project_id,
            user_id: self.user_id,
            provider: self.provider,
            status: DeploymentStatus::from_str(&self.status).map_err(anyhow::Error::msg)?,
            environment: self.environment,
            branch: self.branch,
            url: self.url,
            preview_url: self.preview_url,
            error_message: self.error_message,
            build_time_ms: self.build_time_ms,
            deploy_time_ms: self.deploy_time_ms,
            total_time_ms: self.total_time_ms,
            started_at: chrono::DateTime::parse_from_rfc3339(&self.started_at)?.with_timezone(&Utc),
            completed_at: self
                .completed_at
                .map(|s| chrono::DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
                .transpose()?,
            config_snapshot: serde_json::from_str(&self.config_snapshot)?,
            provider_metadata: serde_json::from_str(&self.provider_metadata)?,
            deleted_at: self
                .deleted_at
                .map(|s| chrono::DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
                .transpose()?,
        })
    }
}

pub struct NewDeployment {
    pub project_id: String,
    pub user_id: String,
    pub provider: String,
    pub environment: String,
    pub branch: String,
    pub config_snapshot: BuildPlan,
}

/// Fields a transition may set. `None` leaves the column unchanged.
#[derive(Default)]
pub struct TransitionPatch {
    pub url: Option<String>,
    pub preview_url: Option<String>,
    pub error_message: Option<String>,
    pub build_time_ms: Option<i64>,
    pub deploy_time_ms: Option<i64>,
    pub total_time_ms: Option<i64>,
    pub provider_metadata: Option<serde_json::Value>,
    pub set_completed_at: bool,
}

pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;
        let db_path = data_dir.join("orchestrator.db");
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .with_context(|| format!("opening sqlite database at {}", db_path.display()))?;
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        const MIGRATIONS: &[&str] = &[
            include_str!("../../migrations/0001_deployments.sql"),
            include_str!("../../migrations/0002_deployment_logs.sql"),
        ];
        for migration in MIGRATIONS {
            for statement in migration.split(';') {
                let statement = statement.trim();
                if statement.is_empty() {
                    continue;
                }
                sqlx::query(statement).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    pub async fn create_deployment(&self, input: NewDeployment) -> Result<Deployment> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let config_snapshot = serde_json::to_string(&input.config_snapshot)?;
        sqlx::query(
            "INSERT INTO deployments
                (id, project_id, user_id, provider, status, environment, branch,
                 started_at, config_snapshot, provider_metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&input.project_id)
        .bind(&input.user_id)
        .bind(&input.provider)
        .bind(DeploymentStatus::Pending.as_str())
        .bind(&input.environment)
        .bind(&input.branch)
        .bind(now.to_rfc3339())
        .bind(config_snapshot)
        .bind("{}")
        .execute(&self.pool)
        .await?;

        self.find_deployment(id)
            .await?
            .context("deployment vanished immediately after insert")
    }

    pub async fn find_deployment(&self, id: Uuid) -> Result<Option<Deployment>> {
        let row = with_timeout(
            sqlx::query_as::<_, DeploymentRow>(
                "SELECT * FROM deployments WHERE id = ? AND deleted_at IS NULL",
            )
            .bind(id.to_string())
            .fetch_optional(&self.pool),
        )
        .await?;
        row.map(DeploymentRow::into_model).transpose()
    }

    pub async fn list_deployments(
        &self,
        project_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<Deployment>, i64)> {
        let limit = limit.clamp(1, 200);
        let offset = (page.saturating_sub(1)) as i64 * limit as i64;

        let rows = with_timeout(
            sqlx::query_as::<_, DeploymentRow>(
                "SELECT * FROM deployments WHERE project_id = ? AND deleted_at IS NULL
                 ORDER BY started_at DESC LIMIT ? OFFSET ?",
            )
            .bind(project_id)
            .bind(limit as i64)
            .bind(offset)
            .fetch_all(&self.pool),
        )
        .await?;

        let total: i64 = with_timeout(
            sqlx::query("SELECT COUNT(*) as c FROM deployments WHERE project_id = ? AND deleted_at IS NULL")
                .bind(project_id)
                .fetch_one(&self.pool),
        )
        .await?
        .try_get("c")?;

        let deployments = rows
            .into_iter()
            .map(DeploymentRow::into_model)
            .collect::<Result<Vec<_>>>()?;
        Ok((deployments, total))
    }

    /// Atomically move a deployment from one of `from` into `to`, applying
    /// `patch`. Returns `true` iff the row matched (i.e. was still in one of
    /// the expected prior states) — the teacher's `claim_session_for_run`
    /// pattern, generalized to the full lifecycle so no row can ever be
    /// mutated after reaching a terminal status.
    pub async fn transition(
        &self,
        id: Uuid,
        from: &[DeploymentStatus],
        to: DeploymentStatus,
        patch: TransitionPatch,
    ) -> Result<bool> {
        let placeholders = from.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "UPDATE deployments SET
                status = ?,
                url = COALESCE(?, url),
                preview_url = COALESCE(?, preview_url),
                error_message = COALESCE(?, error_message),
                build_time_ms = COALESCE(?, build_time_ms),
                deploy_time_ms = COALESCE(?, deploy_time_ms),
                total_time_ms = COALESCE(?, total_time_ms),
                provider_metadata = COALESCE(?, provider_metadata),
                completed_at = CASE WHEN ? THEN ? ELSE completed_at END
             WHERE id = ? AND deleted_at IS NULL AND status IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(patch.url)
            .bind(patch.preview_url)
            .bind(patch.error_message)
            .bind(patch.build_time_ms)
            .bind(patch.deploy_time_ms)
            .bind(patch.total_time_ms)
            .bind(patch.provider_metadata.map(|v| v.to_string()))
            .bind(patch.set_completed_at)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string());

        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Persist a freshly-inferred build plan as `config_snapshot`. Distinct
    /// from [`Storage::transition`] since it does not change `status` and
    /// applies regardless of the row's current state (C7 calls this once,
    /// right after inference, before the `building` transition).
    pub async fn update_config_snapshot(&self, id: Uuid, plan: &BuildPlan) -> Result<()> {
        let config_snapshot = serde_json::to_string(plan)?;
        sqlx::query("UPDATE deployments SET config_snapshot = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(config_snapshot)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn soft_delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE deployments SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Force-fail any row stuck non-terminal for longer than `threshold`
    /// since it started. Used by the orchestrator's supervisory stall sweep
    /// (source spec §4.7's "Stall detection"); idempotent the same way
    /// [`Storage::transition`] is, since a completed row is excluded by the
    /// `status NOT IN (...)` filter.
    pub async fn fail_stalled_since(&self, threshold: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).context("stall threshold out of range")?;
        let result = sqlx::query(
            "UPDATE deployments SET status = 'failed',
                error_message = COALESCE(error_message, 'stall_detected: exceeded orchestrator budget plus grace'),
                completed_at = ?
             WHERE status NOT IN ('live', 'failed', 'cancelled') AND deleted_at IS NULL AND started_at < ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Startup recovery: any row left in a non-terminal state because the
    /// process was killed mid-deployment (no supervisory task survives a
    /// restart to finalize it) is force-failed, mirroring the daemon's
    /// `recover_stale_sessions`. Call once, before accepting new requests —
    /// unlike [`Storage::fail_stalled_since`] this has no time threshold, a
    /// non-terminal row at startup is stale by definition since nothing was
    /// running to move it forward.
    pub async fn recover_stale_deployments(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE deployments SET status = 'failed',
                error_message = COALESCE(error_message, 'internal_error: process restarted mid-deployment'),
                completed_at = ?
             WHERE status NOT IN ('live', 'failed', 'cancelled') AND deleted_at IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
