//! Recurring sweep over expired leases, grounded on
//! `tasks::janitor::run_lease_janitor`'s interval-loop shape, generalized
//! from a single `release_expired_leases` call into a per-lease atomic block
//! that also emits a `lease.expired` receipt alongside the requeue.

use std::sync::Arc;
use std::time::Duration;

use crate::config::GateConfig;
use crate::error::EngineError;
use crate::ids::TenantId;
use crate::model::ReceiptSpec;
use crate::principal::Principal;
use crate::storage::lease_store::LeaseStore;
use crate::storage::receipt_ledger::ReceiptLedger;
use crate::storage::task_store::TaskStore;
use crate::termination::ReceiptType;

pub struct LeaseSweeper {
    pool: sqlx::PgPool,
    tasks: Arc<TaskStore>,
    leases: Arc<LeaseStore>,
    receipts: Arc<ReceiptLedger>,
    cfg: GateConfig,
}

impl LeaseSweeper {
    pub fn new(
        pool: sqlx::PgPool,
        tasks: Arc<TaskStore>,
        leases: Arc<LeaseStore>,
        receipts: Arc<ReceiptLedger>,
        cfg: GateConfig,
    ) -> Self {
        Self {
            pool,
            tasks,
            leases,
            receipts,
            cfg,
        }
    }

    /// Runs until the process exits. Each tick sweeps one bounded batch;
    /// a failure on one lease is logged and skipped rather than aborting
    /// the whole batch — fault isolation mirrors `release_expired_leases`.
    pub async fn run(self) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.cfg.lease_sweep_interval_seconds as u64));
        loop {
            interval.tick().await;
            match self.sweep_once().await {
                Ok(swept) if swept > 0 => {
                    tracing::debug!(instance_id = %self.cfg.instance_id, swept, "lease sweep batch complete")
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(instance_id = %self.cfg.instance_id, error = %e, "lease sweep batch failed")
                }
            }
        }
    }

    pub async fn sweep_once(&self) -> Result<usize, EngineError> {
        let expired = self.leases.get_expired(self.cfg.lease_sweep_batch).await?;
        let mut swept = 0;
        for lease in expired {
            match self.sweep_one(lease.tenant_id, lease.task_id, lease.lease_id).await {
                Ok(()) => swept += 1,
                Err(e) => {
                    tracing::warn!(
                        task_id = %lease.task_id,
                        lease_id = %lease.lease_id,
                        error = %e,
                        "failed to sweep expired lease, will retry next tick"
                    );
                }
            }
        }
        Ok(swept)
    }

    async fn sweep_one(
        &self,
        tenant: TenantId,
        task_id: crate::ids::TaskId,
        lease_id: crate::ids::LeaseId,
    ) -> Result<(), EngineError> {
        let task = self.tasks.get(tenant, task_id).await?;
        let assigned = self
            .receipts
            .latest_of_type_for_task(tenant, task_id, ReceiptType::TaskAssigned)
            .await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineError::Internal(e.into()))?;
        self.tasks.requeue_on_expiry_in(&mut tx, tenant, task_id).await?;
        self.leases.remove_in(&mut tx, tenant, lease_id).await?;
        self.receipts
            .create_in(
                &mut tx,
                tenant,
                ReceiptSpec {
                    receipt_type: ReceiptType::LeaseExpired,
                    from: Principal::system(Principal::SYSTEM_LEDGER)
                        .expect("constant system id is always valid"),
                    to: task.created_by,
                    task_id: Some(task_id),
                    lease_id: Some(lease_id),
                    parents: assigned.map(|r| vec![r.receipt_id]).unwrap_or_default(),
                    body: serde_json::json!({ "task_id": task_id.to_string() }),
                },
                &self.cfg,
            )
            .await?;
        tx.commit().await.map_err(|e| EngineError::Internal(e.into()))?;
        Ok(())
    }
}
