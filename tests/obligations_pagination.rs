//! `list_open_obligations` pagination and the `receipt.acknowledged`
//! notification path (spec §4.7, §6).

use asyncgate::config::GateConfig;
use asyncgate::engine::TaskEngine;
use asyncgate::ids::TenantId;
use asyncgate::model::{TaskRequirements, TaskSpec};
use asyncgate::principal::Principal;
use sqlx::PgPool;

fn test_cfg() -> GateConfig {
    GateConfig::new(None, Some(std::env::temp_dir()), None)
}

fn spec(n: usize) -> TaskSpec {
    TaskSpec {
        task_type: "batch".to_string(),
        payload: serde_json::json!({ "n": n }),
        requirements: TaskRequirements::default(),
        priority: None,
        max_attempts: None,
        retry_backoff_seconds: None,
    }
}

#[sqlx::test(migrations = "src/storage/migrations")]
async fn obligations_paginate_and_skip_discharged_ones(pool: PgPool) {
    let engine = TaskEngine::new(pool, test_cfg());
    let tenant = TenantId::new();
    let agent = Principal::agent("agent-1").unwrap();

    let mut task_ids = Vec::new();
    for n in 0..5 {
        let task = engine.create_task(tenant, &agent, spec(n), None).await.unwrap();
        task_ids.push(task.task_id);
    }

    // Discharge the first task so it must not reappear.
    let claimed = engine.claim_next(tenant, "worker-1", &[], 1, None).await.unwrap();
    let (first_task, lease) = &claimed[0];
    engine
        .complete(
            tenant,
            "worker-1",
            first_task.task_id,
            lease.lease_id,
            serde_json::json!({ "ok": true }),
            serde_json::json!({ "artifacts": [{ "type": "mem", "key": "a" }] }),
        )
        .await
        .unwrap();

    let page1 = engine
        .obligations()
        .list_open_obligations(tenant, &agent, None, 2)
        .await
        .unwrap();
    assert_eq!(page1.items.len(), 2);
    assert!(page1.cursor.is_some());
    assert!(page1.items.iter().all(|r| r.task_id != Some(first_task.task_id)));

    let page2 = engine
        .obligations()
        .list_open_obligations(tenant, &agent, page1.cursor.as_deref(), 2)
        .await
        .unwrap();
    assert_eq!(page2.items.len(), 2);

    let page3 = engine
        .obligations()
        .list_open_obligations(tenant, &agent, page2.cursor.as_deref(), 2)
        .await
        .unwrap();
    assert!(page3.items.is_empty(), "only 4 obligations remain open after discharging one of 5");

    let mut seen: Vec<_> = page1
        .items
        .iter()
        .chain(page2.items.iter())
        .chain(page3.items.iter())
        .map(|r| r.task_id)
        .collect();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 4, "pagination must not repeat or skip an obligation");
}

#[sqlx::test(migrations = "src/storage/migrations")]
async fn acknowledging_a_receipt_does_not_discharge_its_obligation(pool: PgPool) {
    let engine = TaskEngine::new(pool, test_cfg());
    let tenant = TenantId::new();
    let agent = Principal::agent("agent-1").unwrap();

    let task = engine.create_task(tenant, &agent, spec(0), None).await.unwrap();

    let page = engine
        .obligations()
        .list_open_obligations(tenant, &agent, None, 10)
        .await
        .unwrap();
    let assigned_receipt = page.items.into_iter().find(|r| r.task_id == Some(task.task_id)).unwrap();

    engine
        .ack_receipt(tenant, &agent, assigned_receipt.receipt_id)
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
        "receipt.acknowledged is a non-terminal notification, not a discharge"
    );
}
