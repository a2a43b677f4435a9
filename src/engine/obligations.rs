//! `list_open_obligations` (spec §4.7): fetch a bounded batch of candidate
//! `task.assigned` receipts addressed to a principal, then subtract the ones
//! that already have a terminating child — grounded on the batched
//! overlap query already built for `ReceiptLedger::terminated_subset`.

use crate::config::GateConfig;
use crate::error::EngineResult;
use crate::ids::TenantId;
use crate::model::{Cursor, Page, Receipt};
use crate::principal::Principal;
use crate::storage::receipt_ledger::ReceiptLedger;
use crate::termination::ReceiptType;

/// Candidates are over-fetched by this factor before filtering, so a run of
/// already-discharged obligations doesn't starve a single page of results.
const CANDIDATE_FANOUT: i64 = 4;

pub struct ObligationQuery<'a> {
    receipts: &'a ReceiptLedger,
    cfg: &'a GateConfig,
}

impl<'a> ObligationQuery<'a> {
    pub fn new(receipts: &'a ReceiptLedger, cfg: &'a GateConfig) -> Self {
        Self { receipts, cfg }
    }

    /// Returns the unbucketed `{open_obligations, cursor?}` shape the spec's
    /// I8 requires — no grouping by task, type, or principal.
    pub async fn list_open_obligations(
        &self,
        tenant: TenantId,
        principal: &Principal,
        since_cursor: Option<&str>,
        limit: i64,
    ) -> EngineResult<Page<Receipt>> {
        let limit = limit.clamp(1, self.cfg.max_list_limit);
        let decoded = since_cursor.and_then(Cursor::decode);

        let mut open = Vec::new();
        let mut cursor = decoded;
        let mut exhausted = false;

        // Keep pulling candidate batches until either we've filled the page
        // or a batch comes back empty (no more candidates at all).
        while open.len() < limit as usize && !exhausted {
            let batch_size = (limit * CANDIDATE_FANOUT).min(self.cfg.obligation_candidate_hard_cap);
            let candidates = self
                .receipts
                .list_addressed_obligation_candidates(
                    tenant,
                    principal,
                    ReceiptType::TaskAssigned,
                    cursor.map(|c| (c.created_at, c.id)),
                    batch_size,
                )
                .await?;

            if candidates.is_empty() {
                exhausted = true;
                break;
            }

            let candidate_ids: Vec<_> = candidates.iter().map(|r| r.receipt_id).collect();
            let terminated = self.receipts.terminated_subset(tenant, &candidate_ids).await?;

            cursor = candidates.last().map(|r| Cursor {
                created_at: r.created_at,
                id: r.receipt_id.into(),
            });

            for receipt in candidates {
                if open.len() >= limit as usize {
                    break;
                }
                if !terminated.contains(&receipt.receipt_id) {
                    open.push(receipt);
                }
            }
        }

        let next_cursor = if open.len() as i64 >= limit && cursor.is_some() {
            cursor.map(|c| c.encode())
        } else {
            None
        };

        Ok(Page {
            items: open,
            cursor: next_cursor,
        })
    }
}
