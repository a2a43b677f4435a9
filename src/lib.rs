//! AsyncGate: a durable, multi-tenant task ledger for delegated work between
//! agents, workers, and the system — leases, content-addressed receipts, and
//! derived obligations. See `DESIGN.md` for the module-by-module grounding
//! ledger against the teacher repo this crate was built from.

pub mod config;
pub mod engine;
pub mod error;
pub mod facades;
pub mod ids;
pub mod model;
pub mod principal;
pub mod storage;
pub mod telemetry;
pub mod termination;

use std::sync::Arc;

use config::GateConfig;
use engine::sweeper::LeaseSweeper;
use engine::TaskEngine;

/// Shared application state passed to both facades and the sweeper —
/// analogous to the teacher's `AppContext`, trimmed to this crate's much
/// smaller component set.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<GateConfig>,
    pub engine: Arc<TaskEngine>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    pub async fn new(cfg: GateConfig) -> anyhow::Result<Self> {
        let pool = storage::connect(&cfg.database_url).await?;
        let engine = Arc::new(TaskEngine::new(pool, cfg.clone()));
        Ok(Self {
            config: Arc::new(cfg),
            engine,
            started_at: std::time::Instant::now(),
        })
    }

    /// Spawns the recurring lease-expiry sweep as a background task. Returns
    /// a handle so callers can await it (it never returns under normal
    /// operation) or abort it on shutdown.
    pub fn spawn_lease_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let sweeper = LeaseSweeper::new(
            self.engine.pool().clone(),
            Arc::new(storage::task_store::TaskStore::new(self.engine.pool().clone())),
            Arc::new(storage::lease_store::LeaseStore::new(self.engine.pool().clone())),
            Arc::new(storage::receipt_ledger::ReceiptLedger::new(self.engine.pool().clone())),
            (*self.config).clone(),
        );
        tokio::spawn(sweeper.run())
    }
}
