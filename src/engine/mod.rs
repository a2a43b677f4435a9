//! The orchestration layer: composes `TaskStore`, `LeaseStore`, and
//! `ReceiptLedger` atomically, and is the only thing either facade talks to
//! (spec §4.5). Grounded on `agents::orchestrator` for the "validate outside
//! the lock, mutate inside a single atomic block" shape, generalized from
//! its agent-concurrency-cap check to the lease/task/receipt triad here.

pub mod obligations;
pub mod sweeper;

use chrono::Utc;
use sqlx::PgPool;

use crate::config::GateConfig;
use crate::error::{EngineError, EngineResult};
use crate::ids::{LeaseId, TaskId, TenantId};
use crate::model::{Lease, Page, Receipt, Task, TaskFilter, TaskSpec};
use crate::principal::Principal;
use crate::storage::lease_store::LeaseStore;
use crate::storage::receipt_ledger::ReceiptLedger;
use crate::storage::task_store::TaskStore;
use crate::termination::ReceiptType;

pub use obligations::ObligationQuery;

pub struct TaskEngine {
    pool: PgPool,
    tasks: TaskStore,
    leases: LeaseStore,
    receipts: ReceiptLedger,
    cfg: GateConfig,
}

impl TaskEngine {
    pub fn new(pool: PgPool, cfg: GateConfig) -> Self {
        Self {
            tasks: TaskStore::new(pool.clone()),
            leases: LeaseStore::new(pool.clone()),
            receipts: ReceiptLedger::new(pool.clone()),
            pool,
            cfg,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.cfg
    }

    pub fn obligations(&self) -> ObligationQuery<'_> {
        ObligationQuery::new(&self.receipts, &self.cfg)
    }

    /// Inserts the task and emits `task.assigned` in one savepoint.
    pub async fn create_task(
        &self,
        tenant: TenantId,
        principal: &Principal,
        spec: TaskSpec,
        idempotency_key: Option<String>,
    ) -> EngineResult<Task> {
        let mut tx = self.pool.begin().await.map_err(|e| EngineError::Internal(e.into()))?;
        let task = self
            .tasks
            .create_in(&mut tx, tenant, principal, spec, idempotency_key, &self.cfg)
            .await?;
        self.receipts
            .create_in(
                &mut tx,
                tenant,
                crate::model::ReceiptSpec {
                    receipt_type: ReceiptType::TaskAssigned,
                    from: Principal::system(Principal::SYSTEM_LEDGER)
                        .expect("constant system id is always valid"),
                    to: principal.clone(),
                    task_id: Some(task.task_id),
                    lease_id: None,
                    parents: vec![],
                    body: serde_json::json!({ "task_type": task.task_type }),
                },
                &self.cfg,
            )
            .await?;
        tx.commit().await.map_err(|e| EngineError::Internal(e.into()))?;
        Ok(task)
    }

    pub async fn get_task(&self, tenant: TenantId, task_id: TaskId) -> EngineResult<Task> {
        self.tasks.get(tenant, task_id).await
    }

    pub async fn list_tasks(
        &self,
        tenant: TenantId,
        filter: &TaskFilter,
        cursor: Option<&str>,
        limit: i64,
    ) -> EngineResult<Page<Task>> {
        let limit = limit.clamp(1, self.cfg.max_list_limit);
        let decoded = cursor.and_then(crate::model::Cursor::decode);
        let tasks = self
            .tasks
            .list(
                tenant,
                filter,
                decoded.map(|c| (c.created_at, c.id)),
                limit,
            )
            .await?;
        let next_cursor = tasks.last().map(|t| {
            crate::model::Cursor {
                created_at: t.created_at,
                id: t.task_id.into(),
            }
            .encode()
        });
        Ok(Page {
            items: tasks,
            cursor: next_cursor,
        })
    }

    /// Releases any active lease, transitions to `canceled`, and emits
    /// `task.canceled` + `task.result_ready`, all in one savepoint.
    /// Requires `caller` to be the task's `created_by` principal.
    pub async fn cancel_task(
        &self,
        tenant: TenantId,
        caller: &Principal,
        task_id: TaskId,
        reason: &str,
    ) -> EngineResult<()> {
        let task = self.tasks.get(tenant, task_id).await?;
        if &task.created_by != caller {
            return Err(EngineError::Unauthorized {
                principal: caller.to_string(),
                action: "cancel_task".to_string(),
                task_id,
            });
        }

        let assigned = self
            .receipts
            .latest_of_type_for_task(tenant, task_id, ReceiptType::TaskAssigned)
            .await?;

        let mut tx = self.pool.begin().await.map_err(|e| EngineError::Internal(e.into()))?;
        self.leases.release_in(&mut tx, tenant, task_id).await?;
        let transitioned = self.tasks.cancel_in(&mut tx, tenant, task_id).await?;
        if !transitioned {
            return Err(EngineError::InvalidStateTransition {
                task_id,
                from: task.status.to_string(),
                to: "canceled".to_string(),
            });
        }

        let parents = assigned.as_ref().map(|r| vec![r.receipt_id]).unwrap_or_default();
        let canceled = self
            .receipts
            .create_in(
                &mut tx,
                tenant,
                crate::model::ReceiptSpec {
                    receipt_type: ReceiptType::TaskCanceled,
                    from: Principal::system(Principal::SYSTEM_LEDGER)
                        .expect("constant system id is always valid"),
                    to: task.created_by.clone(),
                    task_id: Some(task_id),
                    lease_id: None,
                    parents,
                    body: serde_json::json!({ "reason": reason }),
                },
                &self.cfg,
            )
            .await?;
        self.receipts
            .create_in(
                &mut tx,
                tenant,
                crate::model::ReceiptSpec {
                    receipt_type: ReceiptType::TaskResultReady,
                    from: Principal::system(Principal::SYSTEM_LEDGER)
                        .expect("constant system id is always valid"),
                    to: task.created_by.clone(),
                    task_id: Some(task_id),
                    lease_id: None,
                    parents: vec![canceled.receipt_id],
                    body: serde_json::json!({ "outcome": "canceled" }),
                },
                &self.cfg,
            )
            .await?;
        tx.commit().await.map_err(|e| EngineError::Internal(e.into()))?;
        Ok(())
    }

    /// Thin wrapper over `LeaseStore::claim_next`. No per-task receipts are
    /// emitted here — the claim loop must stay cheap; the owner's view of
    /// the obligation is unaffected until a discharge appears.
    pub async fn claim_next(
        &self,
        tenant: TenantId,
        worker_id: &str,
        capabilities: &[String],
        max_tasks: i64,
        ttl_seconds: Option<i64>,
    ) -> EngineResult<Vec<(Task, Lease)>> {
        let ttl = ttl_seconds
            .unwrap_or(self.cfg.default_lease_ttl_seconds)
            .clamp(1, self.cfg.max_lease_ttl_seconds);
        let claimed = self
            .leases
            .claim_next(tenant, worker_id, capabilities, max_tasks, ttl)
            .await?;
        let mut out = Vec::with_capacity(claimed.len());
        for (task_id, lease) in claimed {
            let task = self.tasks.get(tenant, task_id).await?;
            out.push((task, lease));
        }
        Ok(out)
    }

    pub async fn renew_lease(
        &self,
        tenant: TenantId,
        worker_id: &str,
        task_id: TaskId,
        lease_id: LeaseId,
        extend_by_seconds: i64,
    ) -> EngineResult<Lease> {
        let extend_by = extend_by_seconds.clamp(1, self.cfg.max_lease_ttl_seconds);
        self.leases
            .renew(tenant, task_id, lease_id, worker_id, extend_by, &self.cfg)
            .await
    }

    /// Records a `task.progress` receipt. Gated on a valid lease so a
    /// non-owning worker cannot corrupt progress reporting.
    pub async fn report_progress(
        &self,
        tenant: TenantId,
        worker_id: &str,
        task_id: TaskId,
        lease_id: LeaseId,
        progress: serde_json::Value,
    ) -> EngineResult<Receipt> {
        let lease = self.leases.validate(tenant, task_id, lease_id, worker_id).await?;
        let task = self.tasks.get(tenant, task_id).await?;
        self.receipts
            .create(
                tenant,
                crate::model::ReceiptSpec {
                    receipt_type: ReceiptType::TaskProgress,
                    from: Principal::worker(worker_id).map_err(EngineError::Validation)?,
                    to: task.created_by,
                    task_id: Some(task_id),
                    lease_id: Some(lease.lease_id),
                    parents: vec![],
                    body: progress,
                },
                &self.cfg,
            )
            .await
    }

    /// Validates the lease; in one savepoint: task -> `succeeded`, release
    /// lease, emit `task.completed` (parented on the latest `task.assigned`)
    /// and `task.result_ready`. On any failure the task remains `leased` so
    /// the worker (or the expiry sweep) can retry cleanly.
    pub async fn complete(
        &self,
        tenant: TenantId,
        worker_id: &str,
        task_id: TaskId,
        lease_id: LeaseId,
        result: serde_json::Value,
        outcome_body: serde_json::Value,
    ) -> EngineResult<Task> {
        let lease = self.leases.validate(tenant, task_id, lease_id, worker_id).await?;
        let task = self.tasks.get(tenant, task_id).await?;
        let assigned = self
            .receipts
            .latest_of_type_for_task(tenant, task_id, ReceiptType::TaskAssigned)
            .await?
            .ok_or_else(|| {
                EngineError::Internal(anyhow::anyhow!(
                    "task {task_id} has no task.assigned receipt to discharge"
                ))
            })?;

        let mut tx = self.pool.begin().await.map_err(|e| EngineError::Internal(e.into()))?;
        let transitioned = self
            .tasks
            .transition_in(
                &mut tx,
                tenant,
                task_id,
                crate::model::TaskStatus::Leased,
                crate::model::TaskStatus::Succeeded,
                Some(result),
            )
            .await?;
        if !transitioned {
            return Err(EngineError::InvalidStateTransition {
                task_id,
                from: task.status.to_string(),
                to: "succeeded".to_string(),
            });
        }
        self.leases.release_in(&mut tx, tenant, task_id).await?;

        let completed = self
            .receipts
            .create_in(
                &mut tx,
                tenant,
                crate::model::ReceiptSpec {
                    receipt_type: ReceiptType::TaskCompleted,
                    from: Principal::worker(worker_id).map_err(EngineError::Validation)?,
                    to: task.created_by.clone(),
                    task_id: Some(task_id),
                    lease_id: Some(lease.lease_id),
                    parents: vec![assigned.receipt_id],
                    body: outcome_body,
                },
                &self.cfg,
            )
            .await?;
        self.receipts
            .create_in(
                &mut tx,
                tenant,
                crate::model::ReceiptSpec {
                    receipt_type: ReceiptType::TaskResultReady,
                    from: Principal::system(Principal::SYSTEM_LEDGER)
                        .expect("constant system id is always valid"),
                    to: task.created_by.clone(),
                    task_id: Some(task_id),
                    lease_id: None,
                    parents: vec![completed.receipt_id],
                    body: serde_json::json!({ "outcome": "succeeded" }),
                },
                &self.cfg,
            )
            .await?;
        tx.commit().await.map_err(|e| EngineError::Internal(e.into()))?;
        self.tasks.get(tenant, task_id).await
    }

    /// Validates the lease; in one savepoint: release lease, then either
    /// requeue with backoff (retryable, attempts remain) or transition to
    /// `failed` (non-retryable, or attempts exhausted), emitting
    /// `task.failed` and, when terminal, `task.result_ready`.
    pub async fn fail(
        &self,
        tenant: TenantId,
        worker_id: &str,
        task_id: TaskId,
        lease_id: LeaseId,
        error: &str,
        retryable: bool,
    ) -> EngineResult<Task> {
        let lease = self.leases.validate(tenant, task_id, lease_id, worker_id).await?;
        let task = self.tasks.get(tenant, task_id).await?;
        let assigned = self
            .receipts
            .latest_of_type_for_task(tenant, task_id, ReceiptType::TaskAssigned)
            .await?;

        let mut tx = self.pool.begin().await.map_err(|e| EngineError::Internal(e.into()))?;
        self.leases.release_in(&mut tx, tenant, task_id).await?;

        let will_retry = retryable && task.attempt < task.max_attempts;
        if will_retry {
            let requeued = self
                .tasks
                .requeue_with_backoff_in(&mut tx, tenant, task_id, &task, &self.cfg)
                .await?;
            if !requeued {
                return Err(EngineError::InvalidStateTransition {
                    task_id,
                    from: task.status.to_string(),
                    to: "queued".to_string(),
                });
            }
            // Not a terminal outcome: the task is going back to `queued` for
            // another attempt, so this notification must not use a receipt
            // type that `can_terminate(task.assigned, _)`, or the obligation
            // would read as discharged while the task is still pending
            // re-lease. `task.progress` carries the retry note instead;
            // `task.failed` is reserved for the truly-terminal branch below.
            self.receipts
                .create_in(
                    &mut tx,
                    tenant,
                    crate::model::ReceiptSpec {
                        receipt_type: ReceiptType::TaskProgress,
                        from: Principal::worker(worker_id).map_err(EngineError::Validation)?,
                        to: task.created_by.clone(),
                        task_id: Some(task_id),
                        lease_id: Some(lease.lease_id),
                        parents: assigned.iter().map(|r| r.receipt_id).collect(),
                        body: serde_json::json!({ "error": error, "requeued": true }),
                    },
                    &self.cfg,
                )
                .await?;
            tx.commit().await.map_err(|e| EngineError::Internal(e.into()))?;
            return self.tasks.get(tenant, task_id).await;
        }

        let transitioned = self
            .tasks
            .transition_in(
                &mut tx,
                tenant,
                task_id,
                crate::model::TaskStatus::Leased,
                crate::model::TaskStatus::Failed,
                Some(serde_json::json!({ "error": error })),
            )
            .await?;
        if !transitioned {
            return Err(EngineError::InvalidStateTransition {
                task_id,
                from: task.status.to_string(),
                to: "failed".to_string(),
            });
        }
        let assigned = assigned.ok_or_else(|| {
            EngineError::Internal(anyhow::anyhow!(
                "task {task_id} has no task.assigned receipt to discharge"
            ))
        })?;
        let failed = self
            .receipts
            .create_in(
                &mut tx,
                tenant,
                crate::model::ReceiptSpec {
                    receipt_type: ReceiptType::TaskFailed,
                    from: Principal::worker(worker_id).map_err(EngineError::Validation)?,
                    to: task.created_by.clone(),
                    task_id: Some(task_id),
                    lease_id: Some(lease.lease_id),
                    parents: vec![assigned.receipt_id],
                    body: serde_json::json!({ "error": error, "requeued": false }),
                },
                &self.cfg,
            )
            .await?;
        self.receipts
            .create_in(
                &mut tx,
                tenant,
                crate::model::ReceiptSpec {
                    receipt_type: ReceiptType::TaskResultReady,
                    from: Principal::system(Principal::SYSTEM_LEDGER)
                        .expect("constant system id is always valid"),
                    to: task.created_by.clone(),
                    task_id: Some(task_id),
                    lease_id: None,
                    parents: vec![failed.receipt_id],
                    body: serde_json::json!({ "outcome": "failed" }),
                },
                &self.cfg,
            )
            .await?;
        tx.commit().await.map_err(|e| EngineError::Internal(e.into()))?;
        self.tasks.get(tenant, task_id).await
    }

    pub async fn get_receipt(&self, tenant: TenantId, receipt_id: crate::ids::ReceiptId) -> EngineResult<Receipt> {
        self.receipts.get(tenant, receipt_id).await
    }

    pub async fn list_receipts(
        &self,
        tenant: TenantId,
        filter: &crate::model::ReceiptFilter,
        cursor: Option<&str>,
        limit: i64,
    ) -> EngineResult<Page<Receipt>> {
        let limit = limit.clamp(1, self.cfg.max_list_limit);
        let decoded = cursor.and_then(crate::model::Cursor::decode);
        let receipts = self
            .receipts
            .list(tenant, filter, decoded.map(|c| (c.created_at, c.id)), limit)
            .await?;
        let next_cursor = receipts.last().map(|r| {
            crate::model::Cursor {
                created_at: r.created_at,
                id: r.receipt_id.into(),
            }
            .encode()
        });
        Ok(Page {
            items: receipts,
            cursor: next_cursor,
        })
    }

    /// Append-only telemetry: records a non-terminal `receipt.acknowledged`.
    /// Carries the acknowledged id in `parents` (see DESIGN.md open
    /// question resolution), not in `body`.
    pub async fn ack_receipt(
        &self,
        tenant: TenantId,
        caller: &Principal,
        receipt_id: crate::ids::ReceiptId,
    ) -> EngineResult<Receipt> {
        let acknowledged = self.receipts.get(tenant, receipt_id).await?;
        self.receipts
            .create(
                tenant,
                crate::model::ReceiptSpec {
                    receipt_type: ReceiptType::ReceiptAcknowledged,
                    from: caller.clone(),
                    to: acknowledged.from,
                    task_id: acknowledged.task_id,
                    lease_id: None,
                    parents: vec![receipt_id],
                    body: serde_json::json!({}),
                },
                &self.cfg,
            )
            .await
    }

    pub(crate) fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub(crate) fn leases(&self) -> &LeaseStore {
        &self.leases
    }

    pub(crate) fn receipts(&self) -> &ReceiptLedger {
        &self.receipts
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub fn now() -> chrono::DateTime<Utc> {
    Utc::now()
}
