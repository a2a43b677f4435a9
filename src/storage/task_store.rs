//! Persistent task rows: state machine + idempotent creation, grounded on
//! `tasks::storage::TaskStorage` (`claim_task`'s single conditional `UPDATE`
//! + `rows_affected()` check is the template every CAS here follows) and
//! `tasks::janitor::atomic_claim_with_lease`.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use crate::config::GateConfig;
use crate::error::{EngineError, EngineResult};
use crate::ids::TaskId;
use crate::model::{Task, TaskFilter, TaskRequirements, TaskSpec};
use crate::principal::{Principal, PrincipalKind};

use super::with_timeout;

#[derive(Debug, Clone, sqlx::FromRow)]
struct TaskRow {
    tenant_id: uuid::Uuid,
    task_id: uuid::Uuid,
    idempotency_key: Option<String>,
    task_type: String,
    payload: serde_json::Value,
    requirements: serde_json::Value,
    priority: i32,
    max_attempts: i32,
    retry_backoff_seconds: i64,
    created_by_kind: String,
    created_by_id: String,
    status: String,
    attempt: i32,
    next_eligible_at: DateTime<Utc>,
    result: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn into_task(self) -> EngineResult<Task> {
        let kind: PrincipalKind = self
            .created_by_kind
            .parse()
            .map_err(EngineError::Validation)?;
        let created_by =
            Principal::new(kind, self.created_by_id).map_err(EngineError::Validation)?;
        let status = self.status.parse().map_err(EngineError::Validation)?;
        let requirements: TaskRequirements =
            serde_json::from_value(self.requirements).unwrap_or_default();
        Ok(Task {
            tenant_id: self.tenant_id.into(),
            task_id: self.task_id.into(),
            idempotency_key: self.idempotency_key,
            task_type: self.task_type,
            payload: self.payload,
            requirements,
            priority: self.priority,
            max_attempts: self.max_attempts,
            retry_backoff_seconds: self.retry_backoff_seconds,
            created_by,
            status,
            attempt: self.attempt,
            next_eligible_at: self.next_eligible_at,
            result: self.result,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

pub struct TaskStore {
    pool: PgPool,
}

impl TaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Inserts a new queued task, or returns the existing one for a repeated
    /// `(tenant, idempotency_key)`. The `ON CONFLICT ... DO NOTHING` clause
    /// resolves the create-create race entirely inside the single INSERT
    /// statement, so there is no separate read-after-abort step that could
    /// observe a half-rolled-back transaction.
    pub async fn create(
        &self,
        tenant: crate::ids::TenantId,
        created_by: &Principal,
        spec: TaskSpec,
        idempotency_key: Option<String>,
        cfg: &GateConfig,
    ) -> EngineResult<Task> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineError::Internal(e.into()))?;
        let task = self
            .create_in(&mut tx, tenant, created_by, spec, idempotency_key, cfg)
            .await?;
        tx.commit().await.map_err(|e| EngineError::Internal(e.into()))?;
        Ok(task)
    }

    /// Same as [`TaskStore::create`], against a shared connection so
    /// `TaskEngine::create_task` can emit the `task.assigned` receipt in the
    /// same savepoint as the insert.
    pub async fn create_in(
        &self,
        conn: &mut PgConnection,
        tenant: crate::ids::TenantId,
        created_by: &Principal,
        spec: TaskSpec,
        idempotency_key: Option<String>,
        cfg: &GateConfig,
    ) -> EngineResult<Task> {
        let task_id = TaskId::new();
        let now = Utc::now();
        let priority = spec.priority.unwrap_or(0);
        let max_attempts = spec.max_attempts.unwrap_or(cfg.default_max_attempts);
        let retry_backoff_seconds = spec
            .retry_backoff_seconds
            .unwrap_or(cfg.default_retry_backoff_seconds);
        let requirements_json =
            serde_json::to_value(&spec.requirements).map_err(|e| EngineError::Internal(e.into()))?;

        let row: Option<TaskRow> = sqlx::query_as(
            "INSERT INTO tasks (
                tenant_id, task_id, idempotency_key, task_type, payload, requirements,
                priority, max_attempts, retry_backoff_seconds,
                created_by_kind, created_by_id, status, attempt,
                next_eligible_at, created_at, updated_at
             ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'queued', 1, $12, $12, $12
             )
             ON CONFLICT (tenant_id, idempotency_key) WHERE idempotency_key IS NOT NULL
             DO NOTHING
             RETURNING *",
        )
        .bind(tenant.0)
        .bind(task_id.0)
        .bind(&idempotency_key)
        .bind(&spec.task_type)
        .bind(&spec.payload)
        .bind(&requirements_json)
        .bind(priority)
        .bind(max_attempts)
        .bind(retry_backoff_seconds)
        .bind(created_by.kind.to_string())
        .bind(&created_by.id)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| EngineError::Internal(e.into()))?;

        let row = match row {
            Some(row) => row,
            None => {
                let key = idempotency_key
                    .as_deref()
                    .expect("ON CONFLICT only fires when idempotency_key is Some");
                let existing: Option<TaskRow> = sqlx::query_as(
                    "SELECT * FROM tasks WHERE tenant_id = $1 AND idempotency_key = $2",
                )
                .bind(tenant.0)
                .bind(key)
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| EngineError::Internal(e.into()))?;
                existing.ok_or_else(|| {
                    EngineError::Internal(anyhow::anyhow!(
                        "idempotency conflict on key {key} but no existing row found"
                    ))
                })?
            }
        };
        row.into_task()
    }

    pub async fn get(&self, tenant: crate::ids::TenantId, task_id: TaskId) -> EngineResult<Task> {
        let row: Option<TaskRow> =
            sqlx::query_as("SELECT * FROM tasks WHERE tenant_id = $1 AND task_id = $2")
                .bind(tenant.0)
                .bind(task_id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| EngineError::Internal(e.into()))?;
        row.ok_or(EngineError::TaskNotFound(task_id))?.into_task()
    }

    /// Cursor-paginated by `(created_at, task_id)`, stable under concurrent
    /// inserts (a page boundary never skips or repeats a row as new tasks
    /// are created behind it).
    pub async fn list(
        &self,
        tenant: crate::ids::TenantId,
        filter: &TaskFilter,
        cursor: Option<(DateTime<Utc>, uuid::Uuid)>,
        limit: i64,
    ) -> EngineResult<Vec<Task>> {
        with_timeout(async {
            let (after_ts, after_id) = cursor.unzip();
            let rows: Vec<TaskRow> = sqlx::query_as(
                "SELECT * FROM tasks
                 WHERE tenant_id = $1
                   AND ($2::text IS NULL OR status = $2)
                   AND ($3::text IS NULL OR task_type = $3)
                   AND ($4::timestamptz IS NULL OR (created_at, task_id) > ($4, $5))
                 ORDER BY created_at ASC, task_id ASC
                 LIMIT $6",
            )
            .bind(tenant.0)
            .bind(filter.status.map(|s| s.to_string()))
            .bind(filter.task_type.as_deref())
            .bind(after_ts)
            .bind(after_id.unwrap_or(uuid::Uuid::nil()))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        })
        .await
        .map_err(EngineError::Internal)?
        .into_iter()
        .map(TaskRow::into_task)
        .collect()
    }

    /// Conditional state update. `expected_from` is a single status because
    /// every row of the spec's transition table except cancellation names
    /// exactly one `from`; cancellation uses [`TaskStore::cancel_in`] instead.
    /// Takes a connection rather than `&self.pool` so `TaskEngine` can share
    /// one savepoint across this and the lease/receipt mutations around it.
    pub async fn transition_in(
        &self,
        conn: &mut PgConnection,
        tenant: crate::ids::TenantId,
        task_id: TaskId,
        expected_from: crate::model::TaskStatus,
        to: crate::model::TaskStatus,
        result: Option<serde_json::Value>,
    ) -> EngineResult<bool> {
        let now = Utc::now();
        let rows_affected = sqlx::query(
            "UPDATE tasks SET status = $1, result = $2, updated_at = $3
             WHERE tenant_id = $4 AND task_id = $5 AND status = $6",
        )
        .bind(to.to_string())
        .bind(&result)
        .bind(now)
        .bind(tenant.0)
        .bind(task_id.0)
        .bind(expected_from.to_string())
        .execute(&mut *conn)
        .await
        .map_err(|e| EngineError::Internal(e.into()))?
        .rows_affected();
        Ok(rows_affected > 0)
    }

    /// Any non-terminal status -> `canceled`. Owner check happens in
    /// `TaskEngine` before this is called.
    pub async fn cancel_in(
        &self,
        conn: &mut PgConnection,
        tenant: crate::ids::TenantId,
        task_id: TaskId,
    ) -> EngineResult<bool> {
        let now = Utc::now();
        let rows_affected = sqlx::query(
            "UPDATE tasks SET status = 'canceled', updated_at = $1
             WHERE tenant_id = $2 AND task_id = $3
               AND status NOT IN ('succeeded', 'failed', 'canceled')",
        )
        .bind(now)
        .bind(tenant.0)
        .bind(task_id.0)
        .execute(&mut *conn)
        .await
        .map_err(|e| EngineError::Internal(e.into()))?
        .rows_affected();
        Ok(rows_affected > 0)
    }

    /// Retryable worker failure: requeue with exponential backoff, bumping
    /// `attempt`. If the bump would exceed `max_attempts`, transitions to
    /// `failed` instead — the hinge is whether the increment happens at all,
    /// which [`TaskStore::requeue_on_expiry_in`] deliberately skips.
    pub async fn requeue_with_backoff_in(
        &self,
        conn: &mut PgConnection,
        tenant: crate::ids::TenantId,
        task_id: TaskId,
        task: &Task,
        cfg: &GateConfig,
    ) -> EngineResult<bool> {
        let next_attempt = task.attempt + 1;
        let now = Utc::now();

        if next_attempt > task.max_attempts {
            let rows_affected = sqlx::query(
                "UPDATE tasks SET status = 'failed', attempt = $1, updated_at = $2
                 WHERE tenant_id = $3 AND task_id = $4 AND status = 'leased'",
            )
            .bind(next_attempt)
            .bind(now)
            .bind(tenant.0)
            .bind(task_id.0)
            .execute(&mut *conn)
            .await
            .map_err(|e| EngineError::Internal(e.into()))?
            .rows_affected();
            // The caller distinguishes "requeued" from "became failed" by
            // re-reading task.status afterward; this only reports whether
            // the conditional UPDATE actually matched a row.
            return Ok(rows_affected > 0);
        }

        let backoff = backoff_with_jitter(
            task.retry_backoff_seconds,
            next_attempt,
            cfg.max_retry_backoff_seconds,
            task_id,
        );
        let next_eligible_at = now + chrono::Duration::seconds(backoff);

        let rows_affected = sqlx::query(
            "UPDATE tasks SET status = 'queued', attempt = $1, next_eligible_at = $2, updated_at = $3
             WHERE tenant_id = $4 AND task_id = $5 AND status = 'leased'",
        )
        .bind(next_attempt)
        .bind(next_eligible_at)
        .bind(now)
        .bind(tenant.0)
        .bind(task_id.0)
        .execute(&mut *conn)
        .await
        .map_err(|e| EngineError::Internal(e.into()))?
        .rows_affected();
        Ok(rows_affected > 0)
    }

    /// Lease-expiry requeue: returns the task to `queued` without touching
    /// `attempt`. Lost authority is not the same thing as a failed attempt.
    pub async fn requeue_on_expiry_in(
        &self,
        conn: &mut PgConnection,
        tenant: crate::ids::TenantId,
        task_id: TaskId,
    ) -> EngineResult<bool> {
        let now = Utc::now();
        let jitter = (task_id.0.as_u128() % 5) as i64;
        let next_eligible_at = now + chrono::Duration::seconds(jitter);
        let rows_affected = sqlx::query(
            "UPDATE tasks SET status = 'queued', next_eligible_at = $1, updated_at = $2
             WHERE tenant_id = $3 AND task_id = $4 AND status = 'leased'",
        )
        .bind(next_eligible_at)
        .bind(now)
        .bind(tenant.0)
        .bind(task_id.0)
        .execute(&mut *conn)
        .await
        .map_err(|e| EngineError::Internal(e.into()))?
        .rows_affected();
        Ok(rows_affected > 0)
    }

    /// Moves terminal tasks (`succeeded`/`failed`/`canceled`) updated before
    /// `cutoff` into `tasks_archive` and deletes them from `tasks`, mirroring
    /// `tasks/storage.rs::archive_done_tasks`'s select-then-insert-then-delete
    /// shape. Not wired to a scheduled job; an external collaborator (cron,
    /// an admin command) decides when and how often to call this.
    pub async fn archive_terminal_before(&self, cutoff: DateTime<Utc>) -> EngineResult<usize> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT * FROM tasks
             WHERE status IN ('succeeded', 'failed', 'canceled') AND updated_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Internal(e.into()))?;

        let count = rows.len();
        for row in &rows {
            sqlx::query(
                "INSERT INTO tasks_archive (
                    tenant_id, task_id, idempotency_key, task_type, payload, requirements,
                    priority, max_attempts, retry_backoff_seconds,
                    created_by_kind, created_by_id, status, attempt,
                    next_eligible_at, result, created_at, updated_at
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                 ON CONFLICT (tenant_id, task_id) DO NOTHING",
            )
            .bind(row.tenant_id)
            .bind(row.task_id)
            .bind(&row.idempotency_key)
            .bind(&row.task_type)
            .bind(&row.payload)
            .bind(&row.requirements)
            .bind(row.priority)
            .bind(row.max_attempts)
            .bind(row.retry_backoff_seconds)
            .bind(&row.created_by_kind)
            .bind(&row.created_by_id)
            .bind(&row.status)
            .bind(row.attempt)
            .bind(row.next_eligible_at)
            .bind(&row.result)
            .bind(row.created_at)
            .bind(row.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::Internal(e.into()))?;

            sqlx::query("DELETE FROM tasks WHERE tenant_id = $1 AND task_id = $2")
                .bind(row.tenant_id)
                .bind(row.task_id)
                .execute(&self.pool)
                .await
                .map_err(|e| EngineError::Internal(e.into()))?;
        }

        Ok(count)
    }
}

/// `min(base * 2^(attempt-1), max_cap) + jitter`. Jitter is derived from the
/// task id rather than a random source — there is no randomness dependency
/// in this stack, and spreading retries by id is sufficient to avoid a
/// thundering herd among tasks that failed in the same tick.
fn backoff_with_jitter(base: i64, attempt: i32, max_cap: i64, task_id: TaskId) -> i64 {
    let exp = base.saturating_mul(1i64 << (attempt - 1).clamp(0, 32));
    let capped = exp.min(max_cap).max(base);
    let jitter = (task_id.0.as_u128() % (base.max(1) as u128)) as i64;
    capped + jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_respects_the_cap() {
        let id = TaskId::new();
        assert!(backoff_with_jitter(15, 1, 3600, id) >= 15);
        let grown = backoff_with_jitter(15, 4, 3600, id);
        let capped = backoff_with_jitter(15, 20, 3600, id);
        assert!(grown < capped || capped >= 3600);
        assert!(capped <= 3600 + 15);
    }
}
