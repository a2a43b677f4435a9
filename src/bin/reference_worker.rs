//! A minimal worker against the HTTP façade: claims tasks, "does the work"
//! (echoes the payload back as the result), and reports success. Exists to
//! exercise the façade end-to-end, not as part of the ledger itself (spec
//! §9: "the reference worker ... an example HTTP client, not part of the
//! substrate").

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "reference-worker", about = "Demo AsyncGate worker")]
struct Args {
    /// Base URL of the AsyncGate HTTP façade
    #[arg(long, env = "ASYNCGATE_URL", default_value = "http://localhost:4500")]
    url: String,

    /// Tenant id to operate under
    #[arg(long, env = "ASYNCGATE_TENANT")]
    tenant: Uuid,

    /// This worker's principal id
    #[arg(long, default_value = "reference-worker-1")]
    worker_id: String,

    /// Capabilities this worker offers, comma-separated
    #[arg(long, value_delimiter = ',', default_value = "")]
    capabilities: Vec<String>,

    /// Seconds between poll attempts when no task is available
    #[arg(long, default_value = "2")]
    poll_interval_secs: u64,
}

#[derive(Serialize)]
struct ClaimRequest<'a> {
    worker_id: &'a str,
    capabilities: &'a [String],
    max_tasks: i64,
}

#[derive(Deserialize)]
struct ClaimedItem {
    task: TaskView,
    lease: LeaseView,
}

#[derive(Deserialize)]
struct TaskView {
    task_id: Uuid,
    #[serde(rename = "type")]
    task_type: String,
    payload: serde_json::Value,
}

#[derive(Deserialize)]
struct LeaseView {
    lease_id: Uuid,
}

#[derive(Serialize)]
struct CompleteRequest<'a> {
    worker_id: &'a str,
    lease_id: Uuid,
    result: serde_json::Value,
    outcome: serde_json::Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").compact().init();
    let args = Args::parse();
    let client = reqwest::Client::new();

    info!(url = %args.url, worker_id = %args.worker_id, "reference worker starting");

    loop {
        match claim_and_run(&client, &args).await {
            Ok(true) => continue,
            Ok(false) => tokio::time::sleep(Duration::from_secs(args.poll_interval_secs)).await,
            Err(e) => {
                error!(error = %e, "poll cycle failed, backing off");
                tokio::time::sleep(Duration::from_secs(args.poll_interval_secs)).await;
            }
        }
    }
}

/// Returns `Ok(true)` if a task was claimed and processed, `Ok(false)` if
/// the queue was empty this cycle.
async fn claim_and_run(client: &reqwest::Client, args: &Args) -> Result<bool> {
    let claimed: Vec<ClaimedItem> = client
        .post(format!("{}/v1/claims", args.url))
        .header("x-asyncgate-tenant", args.tenant.to_string())
        .header("x-asyncgate-principal-kind", "worker")
        .header("x-asyncgate-principal-id", &args.worker_id)
        .json(&ClaimRequest {
            worker_id: &args.worker_id,
            capabilities: &args.capabilities,
            max_tasks: 1,
        })
        .send()
        .await
        .context("claim request failed")?
        .error_for_status()
        .context("claim request returned an error status")?
        .json()
        .await
        .context("failed to decode claim response")?;

    let Some(item) = claimed.into_iter().next() else {
        return Ok(false);
    };

    info!(task_id = %item.task.task_id, task_type = %item.task.task_type, "claimed task");

    let result = serde_json::json!({ "echo": item.task.payload });
    let response = client
        .post(format!("{}/v1/tasks/{}/complete", args.url, item.task.task_id))
        .header("x-asyncgate-tenant", args.tenant.to_string())
        .header("x-asyncgate-principal-kind", "worker")
        .header("x-asyncgate-principal-id", &args.worker_id)
        .json(&CompleteRequest {
            worker_id: &args.worker_id,
            lease_id: item.lease.lease_id,
            result,
            outcome: serde_json::json!({ "delivery_proof": { "via": "reference-worker" } }),
        })
        .send()
        .await
        .context("complete request failed")?;

    if !response.status().is_success() {
        warn!(status = %response.status(), task_id = %item.task.task_id, "complete request rejected");
    }

    Ok(true)
}
