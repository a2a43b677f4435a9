//! In-process tool-binding façade (spec §6): the same operations as the
//! HTTP façade, exposed as a plain async trait for a caller already living
//! in the same Rust process — an embedding agent runtime, for instance.
//! Grounded on the teacher's `EventStore`-style async-trait-over-Arc<state>
//! pattern (see `streamable_http_server.rs::EventStore` in the wider pack).

use async_trait::async_trait;

use crate::engine::TaskEngine;
use crate::error::EngineResult;
use crate::ids::{LeaseId, ReceiptId, TaskId, TenantId};
use crate::model::{Lease, Page, Receipt, ReceiptFilter, Task, TaskFilter, TaskSpec};
use crate::principal::Principal;

/// Mirrors every operation the HTTP façade exposes, minus request framing.
/// Implemented once, directly over `TaskEngine` — there is no need for a
/// second implementation since both façades are thin adapters over the
/// same engine, not alternate engines.
#[async_trait]
pub trait AsyncGateTool: Send + Sync {
    async fn create_task(
        &self,
        tenant: TenantId,
        principal: &Principal,
        spec: TaskSpec,
        idempotency_key: Option<String>,
    ) -> EngineResult<Task>;

    async fn get_task(&self, tenant: TenantId, task_id: TaskId) -> EngineResult<Task>;

    async fn list_tasks(
        &self,
        tenant: TenantId,
        filter: &TaskFilter,
        cursor: Option<&str>,
        limit: i64,
    ) -> EngineResult<Page<Task>>;

    async fn cancel_task(
        &self,
        tenant: TenantId,
        caller: &Principal,
        task_id: TaskId,
        reason: &str,
    ) -> EngineResult<()>;

    async fn claim_next(
        &self,
        tenant: TenantId,
        worker_id: &str,
        capabilities: &[String],
        max_tasks: i64,
        ttl_seconds: Option<i64>,
    ) -> EngineResult<Vec<(Task, Lease)>>;

    async fn renew_lease(
        &self,
        tenant: TenantId,
        worker_id: &str,
        task_id: TaskId,
        lease_id: LeaseId,
        extend_by_seconds: i64,
    ) -> EngineResult<Lease>;

    async fn report_progress(
        &self,
        tenant: TenantId,
        worker_id: &str,
        task_id: TaskId,
        lease_id: LeaseId,
        progress: serde_json::Value,
    ) -> EngineResult<Receipt>;

    async fn complete(
        &self,
        tenant: TenantId,
        worker_id: &str,
        task_id: TaskId,
        lease_id: LeaseId,
        result: serde_json::Value,
        outcome_body: serde_json::Value,
    ) -> EngineResult<Task>;

    async fn fail(
        &self,
        tenant: TenantId,
        worker_id: &str,
        task_id: TaskId,
        lease_id: LeaseId,
        error: &str,
        retryable: bool,
    ) -> EngineResult<Task>;

    async fn get_receipt(&self, tenant: TenantId, receipt_id: ReceiptId) -> EngineResult<Receipt>;

    async fn list_receipts(
        &self,
        tenant: TenantId,
        filter: &ReceiptFilter,
        cursor: Option<&str>,
        limit: i64,
    ) -> EngineResult<Page<Receipt>>;

    async fn ack_receipt(
        &self,
        tenant: TenantId,
        caller: &Principal,
        receipt_id: ReceiptId,
    ) -> EngineResult<Receipt>;

    async fn list_open_obligations(
        &self,
        tenant: TenantId,
        principal: &Principal,
        since_cursor: Option<&str>,
        limit: i64,
    ) -> EngineResult<Page<Receipt>>;

    /// System: always `Ok(())` — liveness is "the process is answering
    /// calls at all", identical to the HTTP façade's `/healthz`.
    async fn health(&self) -> EngineResult<()>;

    /// System: the running config snapshot, minus the connection string.
    fn config(&self) -> &crate::config::GateConfig;
}

#[async_trait]
impl AsyncGateTool for TaskEngine {
    async fn create_task(
        &self,
        tenant: TenantId,
        principal: &Principal,
        spec: TaskSpec,
        idempotency_key: Option<String>,
    ) -> EngineResult<Task> {
        TaskEngine::create_task(self, tenant, principal, spec, idempotency_key).await
    }

    async fn get_task(&self, tenant: TenantId, task_id: TaskId) -> EngineResult<Task> {
        TaskEngine::get_task(self, tenant, task_id).await
    }

    async fn list_tasks(
        &self,
        tenant: TenantId,
        filter: &TaskFilter,
        cursor: Option<&str>,
        limit: i64,
    ) -> EngineResult<Page<Task>> {
        TaskEngine::list_tasks(self, tenant, filter, cursor, limit).await
    }

    async fn cancel_task(
        &self,
        tenant: TenantId,
        caller: &Principal,
        task_id: TaskId,
        reason: &str,
    ) -> EngineResult<()> {
        TaskEngine::cancel_task(self, tenant, caller, task_id, reason).await
    }

    async fn claim_next(
        &self,
        tenant: TenantId,
        worker_id: &str,
        capabilities: &[String],
        max_tasks: i64,
        ttl_seconds: Option<i64>,
    ) -> EngineResult<Vec<(Task, Lease)>> {
        TaskEngine::claim_next(self, tenant, worker_id, capabilities, max_tasks, ttl_seconds).await
    }

    async fn renew_lease(
        &self,
        tenant: TenantId,
        worker_id: &str,
        task_id: TaskId,
        lease_id: LeaseId,
        extend_by_seconds: i64,
    ) -> EngineResult<Lease> {
        TaskEngine::renew_lease(self, tenant, worker_id, task_id, lease_id, extend_by_seconds).await
    }

    async fn report_progress(
        &self,
        tenant: TenantId,
        worker_id: &str,
        task_id: TaskId,
        lease_id: LeaseId,
        progress: serde_json::Value,
    ) -> EngineResult<Receipt> {
        TaskEngine::report_progress(self, tenant, worker_id, task_id, lease_id, progress).await
    }

    async fn complete(
        &self,
        tenant: TenantId,
        worker_id: &str,
        task_id: TaskId,
        lease_id: LeaseId,
        result: serde_json::Value,
        outcome_body: serde_json::Value,
    ) -> EngineResult<Task> {
        TaskEngine::complete(self, tenant, worker_id, task_id, lease_id, result, outcome_body).await
    }

    async fn fail(
        &self,
        tenant: TenantId,
        worker_id: &str,
        task_id: TaskId,
        lease_id: LeaseId,
        error: &str,
        retryable: bool,
    ) -> EngineResult<Task> {
        TaskEngine::fail(self, tenant, worker_id, task_id, lease_id, error, retryable).await
    }

    async fn get_receipt(&self, tenant: TenantId, receipt_id: ReceiptId) -> EngineResult<Receipt> {
        TaskEngine::get_receipt(self, tenant, receipt_id).await
    }

    async fn list_receipts(
        &self,
        tenant: TenantId,
        filter: &ReceiptFilter,
        cursor: Option<&str>,
        limit: i64,
    ) -> EngineResult<Page<Receipt>> {
        TaskEngine::list_receipts(self, tenant, filter, cursor, limit).await
    }

    async fn ack_receipt(
        &self,
        tenant: TenantId,
        caller: &Principal,
        receipt_id: ReceiptId,
    ) -> EngineResult<Receipt> {
        TaskEngine::ack_receipt(self, tenant, caller, receipt_id).await
    }

    async fn list_open_obligations(
        &self,
        tenant: TenantId,
        principal: &Principal,
        since_cursor: Option<&str>,
        limit: i64,
    ) -> EngineResult<Page<Receipt>> {
        self.obligations()
            .list_open_obligations(tenant, principal, since_cursor, limit)
            .await
    }

    async fn health(&self) -> EngineResult<()> {
        Ok(())
    }

    fn config(&self) -> &crate::config::GateConfig {
        TaskEngine::config(self)
    }
}
