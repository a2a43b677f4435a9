//! End-to-end scenarios against a real Postgres test database (spec §8),
//! using `#[sqlx::test]` the way the ecosystem intends: one throwaway
//! database per test, migrated automatically from `src/storage/migrations`.

use asyncgate::config::GateConfig;
use asyncgate::engine::TaskEngine;
use asyncgate::ids::TenantId;
use asyncgate::model::{ReceiptFilter, TaskFilter, TaskRequirements, TaskSpec};
use asyncgate::principal::Principal;
use sqlx::PgPool;

fn test_cfg() -> GateConfig {
    GateConfig::new(None, Some(std::env::temp_dir()), None)
}

fn spec(task_type: &str) -> TaskSpec {
    TaskSpec {
        task_type: task_type.to_string(),
        payload: serde_json::json!({ "n": 1 }),
        requirements: TaskRequirements::default(),
        priority: None,
        max_attempts: Some(2),
        retry_backoff_seconds: Some(1),
    }
}

#[sqlx::test(migrations = "src/storage/migrations")]
async fn happy_path_closes_the_obligation(pool: PgPool) {
    let engine = TaskEngine::new(pool, test_cfg());
    let tenant = TenantId::new();
    let agent = Principal::agent("agent-1").unwrap();

    let task = engine
        .create_task(tenant, &agent, spec("render"), None)
        .await
        .unwrap();

    let open = engine
        .obligations()
        .list_open_obligations(tenant, &agent, None, 10)
        .await
        .unwrap();
    assert_eq!(open.items.len(), 1);
    assert_eq!(open.items[0].task_id, Some(task.task_id));

    let claimed = engine
        .claim_next(tenant, "worker-1", &[], 1, None)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    let (claimed_task, lease) = &claimed[0];
    assert_eq!(claimed_task.task_id, task.task_id);

    engine
        .complete(
            tenant,
            "worker-1",
            task.task_id,
            lease.lease_id,
            serde_json::json!({ "ok": true }),
            serde_json::json!({ "artifacts": [{ "type": "mem", "key": "out" }] }),
        )
        .await
        .unwrap();

    let still_open = engine
        .obligations()
        .list_open_obligations(tenant, &agent, None, 10)
        .await
        .unwrap();
    assert!(still_open.items.is_empty(), "completion with locatability should discharge the obligation");

    let final_task = engine.get_task(tenant, task.task_id).await.unwrap();
    assert_eq!(final_task.status.to_string(), "succeeded");
}

#[sqlx::test(migrations = "src/storage/migrations")]
async fn lease_expiry_requeues_without_burning_an_attempt(pool: PgPool) {
    let engine = TaskEngine::new(pool.clone(), test_cfg());
    let tenant = TenantId::new();
    let agent = Principal::agent("agent-1").unwrap();

    let task = engine.create_task(tenant, &agent, spec("render"), None).await.unwrap();
    let claimed = engine.claim_next(tenant, "worker-1", &[], 1, Some(1)).await.unwrap();
    assert_eq!(claimed.len(), 1);

    // Force the lease to look expired without waiting on the TTL.
    sqlx::query("UPDATE leases SET expires_at = now() - interval '1 second'")
        .execute(&pool)
        .await
        .unwrap();

    let tasks = std::sync::Arc::new(asyncgate::storage::task_store::TaskStore::new(pool.clone()));
    let leases = std::sync::Arc::new(asyncgate::storage::lease_store::LeaseStore::new(pool.clone()));
    let receipts = std::sync::Arc::new(asyncgate::storage::receipt_ledger::ReceiptLedger::new(pool.clone()));
    let sweeper = asyncgate::engine::sweeper::LeaseSweeper::new(pool.clone(), tasks, leases, receipts, test_cfg());
    let swept = sweeper.sweep_once().await.unwrap();
    assert_eq!(swept, 1);

    let requeued = engine.get_task(tenant, task.task_id).await.unwrap();
    assert_eq!(requeued.status.to_string(), "queued");
    assert_eq!(requeued.attempt, 1, "lease expiry must not burn an attempt");

    let still_open = engine
        .obligations()
        .list_open_obligations(tenant, &agent, None, 10)
        .await
        .unwrap();
    assert_eq!(still_open.items.len(), 1, "obligation remains open across a lost lease");
}

#[sqlx::test(migrations = "src/storage/migrations")]
async fn retryable_failure_requeues_with_backoff_until_attempts_exhausted(pool: PgPool) {
    let engine = TaskEngine::new(pool, test_cfg());
    let tenant = TenantId::new();
    let agent = Principal::agent("agent-1").unwrap();

    let task = engine.create_task(tenant, &agent, spec("flaky"), None).await.unwrap();

    let claimed = engine.claim_next(tenant, "worker-1", &[], 1, None).await.unwrap();
    let (_, lease) = &claimed[0];
    let after_first_failure = engine
        .fail(tenant, "worker-1", task.task_id, lease.lease_id, "boom", true)
        .await
        .unwrap();
    assert_eq!(after_first_failure.status.to_string(), "queued");
    assert_eq!(after_first_failure.attempt, 2);

    let claimed = engine.claim_next(tenant, "worker-1", &[], 1, None).await.unwrap();
    let (_, lease) = &claimed[0];
    let after_second_failure = engine
        .fail(tenant, "worker-1", task.task_id, lease.lease_id, "boom again", true)
        .await
        .unwrap();
    assert_eq!(
        after_second_failure.status.to_string(),
        "failed",
        "attempt 2 was max_attempts, the task must become terminal"
    );
}

#[sqlx::test(migrations = "src/storage/migrations")]
async fn non_retryable_failure_is_terminal_immediately(pool: PgPool) {
    let engine = TaskEngine::new(pool, test_cfg());
    let tenant = TenantId::new();
    let agent = Principal::agent("agent-1").unwrap();

    let task = engine.create_task(tenant, &agent, spec("strict"), None).await.unwrap();
    let claimed = engine.claim_next(tenant, "worker-1", &[], 1, None).await.unwrap();
    let (_, lease) = &claimed[0];

    let failed = engine
        .fail(tenant, "worker-1", task.task_id, lease.lease_id, "unrecoverable", false)
        .await
        .unwrap();
    assert_eq!(failed.status.to_string(), "failed");
    assert_eq!(failed.attempt, 1, "a non-retryable failure does not bump attempt");
}

#[sqlx::test(migrations = "src/storage/migrations")]
async fn completion_without_locatability_leaves_the_obligation_open_with_an_anomaly(pool: PgPool) {
    let engine = TaskEngine::new(pool, test_cfg());
    let tenant = TenantId::new();
    let agent = Principal::agent("agent-1").unwrap();

    let task = engine.create_task(tenant, &agent, spec("render"), None).await.unwrap();
    let claimed = engine.claim_next(tenant, "worker-1", &[], 1, None).await.unwrap();
    let (_, lease) = &claimed[0];

    engine
        .complete(
            tenant,
            "worker-1",
            task.task_id,
            lease.lease_id,
            serde_json::json!({ "ok": true }),
            serde_json::json!({ "summary": "done, no pointer recorded" }),
        )
        .await
        .unwrap();

    let still_open = engine
        .obligations()
        .list_open_obligations(tenant, &agent, None, 10)
        .await
        .unwrap();
    assert_eq!(
        still_open.items.len(),
        1,
        "a task.completed receipt without locatability must not discharge the obligation"
    );

    let task_status = engine.get_task(tenant, task.task_id).await.unwrap();
    assert_eq!(task_status.status.to_string(), "succeeded");
}

#[sqlx::test(migrations = "src/storage/migrations")]
async fn concurrent_claims_on_one_task_have_exactly_one_winner(pool: PgPool) {
    let engine = std::sync::Arc::new(TaskEngine::new(pool, test_cfg()));
    let tenant = TenantId::new();
    let agent = Principal::agent("agent-1").unwrap();
    engine.create_task(tenant, &agent, spec("render"), None).await.unwrap();

    let e1 = engine.clone();
    let e2 = engine.clone();
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { e1.claim_next(tenant, "worker-a", &[], 1, None).await }),
        tokio::spawn(async move { e2.claim_next(tenant, "worker-b", &[], 1, None).await }),
    );
    let claimed_a = r1.unwrap().unwrap();
    let claimed_b = r2.unwrap().unwrap();
    assert_eq!(claimed_a.len() + claimed_b.len(), 1, "exactly one worker should win the claim");
}

#[sqlx::test(migrations = "src/storage/migrations")]
async fn idempotency_key_dedups_repeated_create(pool: PgPool) {
    let engine = TaskEngine::new(pool, test_cfg());
    let tenant = TenantId::new();
    let agent = Principal::agent("agent-1").unwrap();

    let first = engine
        .create_task(tenant, &agent, spec("render"), Some("job-42".to_string()))
        .await
        .unwrap();
    let second = engine
        .create_task(tenant, &agent, spec("render"), Some("job-42".to_string()))
        .await
        .unwrap();
    assert_eq!(first.task_id, second.task_id);

    let filter = TaskFilter::default();
    let page = engine.list_tasks(tenant, &filter, None, 50).await.unwrap();
    assert_eq!(page.items.len(), 1);
}

#[sqlx::test(migrations = "src/storage/migrations")]
async fn list_receipts_filters_by_task_and_follows_the_chain(pool: PgPool) {
    let engine = TaskEngine::new(pool, test_cfg());
    let tenant = TenantId::new();
    let agent = Principal::agent("agent-1").unwrap();

    let task = engine.create_task(tenant, &agent, spec("render"), None).await.unwrap();
    let other = engine.create_task(tenant, &agent, spec("render"), None).await.unwrap();

    let claimed = engine.claim_next(tenant, "worker-1", &[], 2, None).await.unwrap();
    let (_, lease) = claimed.iter().find(|(t, _)| t.task_id == task.task_id).unwrap();
    engine
        .complete(
            tenant,
            "worker-1",
            task.task_id,
            lease.lease_id,
            serde_json::json!({ "ok": true }),
            serde_json::json!({ "artifacts": [{ "type": "mem", "key": "out" }] }),
        )
        .await
        .unwrap();

    let filter = ReceiptFilter {
        task_id: Some(task.task_id),
        receipt_type: None,
    };
    let page = engine.list_receipts(tenant, &filter, None, 50).await.unwrap();
    let types: Vec<_> = page.items.iter().map(|r| r.receipt_type.clone()).collect();
    assert!(types.contains(&"task.assigned".to_string()));
    assert!(types.contains(&"task.completed".to_string()));
    assert!(types.contains(&"task.result_ready".to_string()));
    assert!(
        page.items.iter().all(|r| r.task_id == Some(task.task_id)),
        "filtering by task_id must not leak receipts from other tasks"
    );
    assert!(page.items.iter().all(|r| r.task_id != Some(other.task_id)));
}

#[sqlx::test(migrations = "src/storage/migrations")]
async fn cancel_is_rejected_for_a_non_owner(pool: PgPool) {
    let engine = TaskEngine::new(pool, test_cfg());
    let tenant = TenantId::new();
    let owner = Principal::agent("agent-owner").unwrap();
    let impostor = Principal::agent("agent-impostor").unwrap();

    let task = engine.create_task(tenant, &owner, spec("render"), None).await.unwrap();
    let result = engine.cancel_task(tenant, &impostor, task.task_id, "nope").await;
    assert!(matches!(result, Err(asyncgate::error::EngineError::Unauthorized { .. })));

    engine.cancel_task(tenant, &owner, task.task_id, "no longer needed").await.unwrap();
    let canceled = engine.get_task(tenant, task.task_id).await.unwrap();
    assert_eq!(canceled.status.to_string(), "canceled");
}
