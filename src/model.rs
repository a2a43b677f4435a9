//! Domain types shared by the three stores, the engine, and both facades —
//! the vocabulary of §3 DATA MODEL given concrete Rust shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{LeaseId, ReceiptId, TaskId, TenantId};
use crate::principal::Principal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Leased,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Leased => "leased",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "leased" => Ok(TaskStatus::Leased),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "canceled" => Ok(TaskStatus::Canceled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// `requirements` — structured, includes the capability set a worker must
/// offer a subset match against to claim the task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequirements {
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// What a caller supplies to `create_task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub requirements: TaskRequirements,
    pub priority: Option<i32>,
    pub max_attempts: Option<i32>,
    pub retry_backoff_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub tenant_id: TenantId,
    pub task_id: TaskId,
    pub idempotency_key: Option<String>,
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: serde_json::Value,
    pub requirements: TaskRequirements,
    pub priority: i32,
    pub max_attempts: i32,
    pub retry_backoff_seconds: i64,
    pub created_by: Principal,
    pub status: TaskStatus,
    pub attempt: i32,
    pub next_eligible_at: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
}

/// Filters for `list_receipts` (spec §6). `task_id` is by far the common
/// case — an agent paging through the history of one delegated task — so it
/// is the only filter the obligation-scan index needs to serve cheaply;
/// `receipt_type` narrows further in memory-cheap SQL, not a second index.
#[derive(Debug, Clone, Default)]
pub struct ReceiptFilter {
    pub task_id: Option<TaskId>,
    pub receipt_type: Option<crate::termination::ReceiptType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub tenant_id: TenantId,
    pub lease_id: LeaseId,
    pub task_id: TaskId,
    pub worker_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewal_count: i32,
}

/// What a caller supplies to `ReceiptLedger::create`.
#[derive(Debug, Clone)]
pub struct ReceiptSpec {
    pub receipt_type: crate::termination::ReceiptType,
    pub from: Principal,
    pub to: Principal,
    pub task_id: Option<TaskId>,
    pub lease_id: Option<LeaseId>,
    pub parents: Vec<ReceiptId>,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub tenant_id: TenantId,
    pub receipt_id: ReceiptId,
    pub receipt_type: String,
    pub from: Principal,
    pub to: Principal,
    pub task_id: Option<TaskId>,
    pub lease_id: Option<LeaseId>,
    pub parents: Vec<ReceiptId>,
    pub body: serde_json::Value,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

/// A cursor-paginated result page, keyed by `(created_at, id)` for
/// stability under concurrent inserts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub cursor: Option<String>,
}

/// `(created_at, id)` composite cursor, opaque to callers.
#[derive(Debug, Clone, Copy)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub id: uuid::Uuid,
}

impl Cursor {
    pub fn encode(&self) -> String {
        format!("{}:{}", self.created_at.to_rfc3339(), self.id)
    }

    pub fn decode(s: &str) -> Option<Self> {
        // The RFC3339 timestamp itself contains colons; the UUID suffix
        // doesn't, so split from the right.
        let (ts, id) = s.rsplit_once(':')?;
        Some(Self {
            created_at: DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc),
            id: uuid::Uuid::parse_str(id).ok()?,
        })
    }
}
