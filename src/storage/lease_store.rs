//! Persistent lease rows: single-active-lease-per-task, renewal and
//! lifetime caps, and the `claim_next` skip-locked claim loop — the
//! concurrency-sensitive core grounded on
//! `tasks::janitor::atomic_claim_with_lease` and `release_expired_leases`,
//! generalized from a single conditional `UPDATE` into the two-statement
//! "lock candidates, then claim the matching subset" shape the spec's
//! capability-subset filter requires.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use crate::config::GateConfig;
use crate::error::{EngineError, EngineResult};
use crate::ids::{LeaseId, TaskId, TenantId};

#[derive(Debug, Clone, sqlx::FromRow)]
struct LeaseRow {
    tenant_id: uuid::Uuid,
    lease_id: uuid::Uuid,
    task_id: uuid::Uuid,
    worker_id: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    renewal_count: i32,
}

impl From<LeaseRow> for crate::model::Lease {
    fn from(row: LeaseRow) -> Self {
        crate::model::Lease {
            tenant_id: row.tenant_id.into(),
            lease_id: row.lease_id.into(),
            task_id: row.task_id.into(),
            worker_id: row.worker_id,
            acquired_at: row.acquired_at,
            expires_at: row.expires_at,
            renewal_count: row.renewal_count,
        }
    }
}

pub struct LeaseStore {
    pool: PgPool,
}

impl LeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Claims up to `max_tasks` queued, eligible tasks whose required
    /// capabilities are a subset of `capabilities`, highest priority and
    /// oldest first. `FOR UPDATE SKIP LOCKED` lets two concurrent callers
    /// run this query against overlapping candidate sets without
    /// serializing on each other; a candidate whose capability set doesn't
    /// match is left untouched by the same statement that locked it, so the
    /// lock is released the instant the transaction commits rather than
    /// held for the life of the whole batch.
    pub async fn claim_next(
        &self,
        tenant: TenantId,
        worker_id: &str,
        capabilities: &[String],
        max_tasks: i64,
        ttl_seconds: i64,
    ) -> EngineResult<Vec<(TaskId, crate::model::Lease)>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineError::Internal(e.into()))?;
        let now = Utc::now();

        let candidates: Vec<(uuid::Uuid, serde_json::Value)> = sqlx::query_as(
            "SELECT task_id, requirements FROM tasks
             WHERE tenant_id = $1 AND status = 'queued' AND next_eligible_at <= $2
             ORDER BY priority DESC, created_at ASC, task_id ASC
             LIMIT $3
             FOR UPDATE SKIP LOCKED",
        )
        .bind(tenant.0)
        .bind(now)
        .bind(max_tasks.max(1) * 4)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| EngineError::Internal(e.into()))?;

        let mut claimed = Vec::new();
        for (task_id, requirements) in candidates {
            if claimed.len() as i64 >= max_tasks {
                break;
            }
            let required: Vec<String> = requirements
                .get("capabilities")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            if !required.iter().all(|cap| capabilities.contains(cap)) {
                continue;
            }

            let lease_id = LeaseId::new();
            let expires_at = now + chrono::Duration::seconds(ttl_seconds);

            sqlx::query(
                "UPDATE tasks SET status = 'leased', updated_at = $1
                 WHERE tenant_id = $2 AND task_id = $3 AND status = 'queued'",
            )
            .bind(now)
            .bind(tenant.0)
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineError::Internal(e.into()))?;

            sqlx::query(
                "INSERT INTO leases (tenant_id, lease_id, task_id, worker_id, acquired_at, expires_at, renewal_count)
                 VALUES ($1, $2, $3, $4, $5, $6, 0)",
            )
            .bind(tenant.0)
            .bind(lease_id.0)
            .bind(task_id)
            .bind(worker_id)
            .bind(now)
            .bind(expires_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineError::Internal(e.into()))?;

            claimed.push((
                TaskId::from(task_id),
                crate::model::Lease {
                    tenant_id: tenant,
                    lease_id,
                    task_id: TaskId::from(task_id),
                    worker_id: worker_id.to_string(),
                    acquired_at: now,
                    expires_at,
                    renewal_count: 0,
                },
            ));
        }

        tx.commit().await.map_err(|e| EngineError::Internal(e.into()))?;
        Ok(claimed)
    }

    /// Pure read: the lease iff it matches `task_id`, `worker_id`, and is
    /// unexpired.
    pub async fn validate(
        &self,
        tenant: TenantId,
        task_id: TaskId,
        lease_id: LeaseId,
        worker_id: &str,
    ) -> EngineResult<crate::model::Lease> {
        let now = Utc::now();
        let row: Option<LeaseRow> = sqlx::query_as(
            "SELECT * FROM leases
             WHERE tenant_id = $1 AND lease_id = $2 AND task_id = $3
               AND worker_id = $4 AND expires_at > $5",
        )
        .bind(tenant.0)
        .bind(lease_id.0)
        .bind(task_id.0)
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::Internal(e.into()))?;
        row.map(Into::into)
            .ok_or(EngineError::LeaseInvalidOrExpired(lease_id))
    }

    /// Extends `expires_at`, enforcing the renewal-count and lifetime caps.
    /// The `UPDATE`'s `WHERE expires_at > now()` is the compare-and-set that
    /// keeps a client racing the sweeper from resurrecting an expired lease.
    pub async fn renew(
        &self,
        tenant: TenantId,
        task_id: TaskId,
        lease_id: LeaseId,
        worker_id: &str,
        extend_by_seconds: i64,
        cfg: &GateConfig,
    ) -> EngineResult<crate::model::Lease> {
        let lease = self.validate(tenant, task_id, lease_id, worker_id).await?;

        if lease.renewal_count + 1 > cfg.max_lease_renewals {
            return Err(EngineError::RenewalLimitExceeded {
                lease_id,
                max_renewals: cfg.max_lease_renewals,
            });
        }
        let now = Utc::now();
        let lifetime = (now - lease.acquired_at).num_seconds() + extend_by_seconds;
        if lifetime > cfg.max_lease_lifetime_seconds {
            return Err(EngineError::LifetimeExceeded {
                lease_id,
                max_lifetime_secs: cfg.max_lease_lifetime_seconds,
            });
        }

        let new_expires_at = now + chrono::Duration::seconds(extend_by_seconds);
        let rows_affected = sqlx::query(
            "UPDATE leases SET expires_at = $1, renewal_count = renewal_count + 1
             WHERE tenant_id = $2 AND lease_id = $3 AND task_id = $4
               AND worker_id = $5 AND expires_at > $6",
        )
        .bind(new_expires_at)
        .bind(tenant.0)
        .bind(lease_id.0)
        .bind(task_id.0)
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Internal(e.into()))?
        .rows_affected();

        if rows_affected == 0 {
            return Err(EngineError::LeaseInvalidOrExpired(lease_id));
        }

        self.validate(tenant, task_id, lease_id, worker_id).await
    }

    /// Removes the active lease for `task_id`, if any. Takes a connection so
    /// `TaskEngine` can release the lease in the same savepoint as the task
    /// transition and receipt emission it accompanies.
    pub async fn release_in(
        &self,
        conn: &mut PgConnection,
        tenant: TenantId,
        task_id: TaskId,
    ) -> EngineResult<()> {
        sqlx::query("DELETE FROM leases WHERE tenant_id = $1 AND task_id = $2")
            .bind(tenant.0)
            .bind(task_id.0)
            .execute(&mut *conn)
            .await
            .map_err(|e| EngineError::Internal(e.into()))?;
        Ok(())
    }

    /// Bounded batch of expired leases, for the sweeper only.
    pub async fn get_expired(&self, limit: i64) -> EngineResult<Vec<crate::model::Lease>> {
        let now = Utc::now();
        let rows: Vec<LeaseRow> = sqlx::query_as(
            "SELECT * FROM leases WHERE expires_at <= $1 ORDER BY expires_at ASC LIMIT $2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Internal(e.into()))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Removes one specific lease row by id, in the sweeper's per-lease
    /// savepoint alongside the matching `requeue_on_expiry`.
    pub async fn remove_in(
        &self,
        conn: &mut PgConnection,
        tenant: TenantId,
        lease_id: LeaseId,
    ) -> EngineResult<()> {
        sqlx::query("DELETE FROM leases WHERE tenant_id = $1 AND lease_id = $2")
            .bind(tenant.0)
            .bind(lease_id.0)
            .execute(&mut *conn)
            .await
            .map_err(|e| EngineError::Internal(e.into()))?;
        Ok(())
    }
}
