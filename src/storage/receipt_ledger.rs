//! Append-only receipt ledger: content-addressed dedup, parent/terminator
//! validation, and locatability enforcement (§4.4). The CAS idiom is the
//! same one `task_store` and `lease_store` use; what's new here is the
//! content hash and the inverted-index-backed `has_terminator` probe.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{PgConnection, PgPool};

use crate::config::{GateConfig, LocatabilityPolicy};
use crate::error::{EngineError, EngineResult};
use crate::ids::{ReceiptId, TenantId};
use crate::model::{Receipt, ReceiptSpec};
use crate::principal::{Principal, PrincipalKind};
use crate::termination::{can_terminate, is_terminal_type, terminal_types, ReceiptType};

#[derive(Debug, Clone, sqlx::FromRow)]
struct ReceiptRow {
    tenant_id: uuid::Uuid,
    receipt_id: uuid::Uuid,
    receipt_type: String,
    from_kind: String,
    from_id: String,
    to_kind: String,
    to_id: String,
    task_id: Option<uuid::Uuid>,
    lease_id: Option<uuid::Uuid>,
    parents: Vec<uuid::Uuid>,
    body: serde_json::Value,
    content_hash: String,
    created_at: DateTime<Utc>,
}

impl ReceiptRow {
    fn into_receipt(self) -> EngineResult<Receipt> {
        let from_kind: PrincipalKind = self.from_kind.parse().map_err(EngineError::Validation)?;
        let to_kind: PrincipalKind = self.to_kind.parse().map_err(EngineError::Validation)?;
        Ok(Receipt {
            tenant_id: self.tenant_id.into(),
            receipt_id: self.receipt_id.into(),
            receipt_type: self.receipt_type,
            from: Principal::new(from_kind, self.from_id).map_err(EngineError::Validation)?,
            to: Principal::new(to_kind, self.to_id).map_err(EngineError::Validation)?,
            task_id: self.task_id.map(Into::into),
            lease_id: self.lease_id.map(Into::into),
            parents: self.parents.into_iter().map(Into::into).collect(),
            body: self.body,
            hash: self.content_hash,
            created_at: self.created_at,
        })
    }
}

/// Deterministic body encoding: `serde_json::Map`'s default backing store is
/// a `BTreeMap`, so `to_vec` already yields sorted keys and no insignificant
/// whitespace — exactly what the content hash needs, with no extra
/// canonicalization step of our own.
fn canonical_body_hash(body: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

fn content_hash(
    receipt_type: ReceiptType,
    task_id: Option<uuid::Uuid>,
    from: &Principal,
    to: &Principal,
    lease_id: Option<uuid::Uuid>,
    parents: &[ReceiptId],
    body: &serde_json::Value,
) -> String {
    let mut sorted_parents: Vec<uuid::Uuid> = parents.iter().map(|p| p.0).collect();
    sorted_parents.sort();

    let mut hasher = Sha256::new();
    hasher.update(receipt_type.to_string().as_bytes());
    hasher.update(task_id.map(|t| t.to_string()).unwrap_or_default().as_bytes());
    hasher.update(from.to_string().as_bytes());
    hasher.update(to.to_string().as_bytes());
    hasher.update(lease_id.map(|l| l.to_string()).unwrap_or_default().as_bytes());
    for p in &sorted_parents {
        hasher.update(p.as_bytes());
    }
    hasher.update(canonical_body_hash(body).as_bytes());
    hex::encode(hasher.finalize())
}

pub fn has_locatability(body: &serde_json::Value) -> bool {
    body.get("artifacts").and_then(|v| v.as_array()).is_some()
        || body.get("delivery_proof").is_some()
}

pub struct ReceiptLedger {
    pool: PgPool,
}

impl ReceiptLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Standalone entry point: opens its own transaction. Engine operations
    /// that already hold a savepoint-scoped transaction call
    /// [`ReceiptLedger::create_in`] directly against it instead, so the
    /// receipt write shares atomicity with the task/lease mutations around it.
    pub async fn create(
        &self,
        tenant: TenantId,
        spec: ReceiptSpec,
        cfg: &GateConfig,
    ) -> EngineResult<Receipt> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineError::Internal(e.into()))?;
        let receipt = self.create_in(&mut tx, tenant, spec, cfg).await?;
        tx.commit().await.map_err(|e| EngineError::Internal(e.into()))?;
        Ok(receipt)
    }

    /// Validates and appends a receipt against an existing connection —
    /// validation order exactly follows §4.4: size caps, terminal-parent
    /// legality, locatability, then hash-collision dedup.
    pub async fn create_in(
        &self,
        conn: &mut PgConnection,
        tenant: TenantId,
        spec: ReceiptSpec,
        cfg: &GateConfig,
    ) -> EngineResult<Receipt> {
        let body_len = serde_json::to_vec(&spec.body).map(|b| b.len()).unwrap_or(0);
        if body_len > cfg.max_receipt_body_bytes {
            return Err(EngineError::Validation(format!(
                "receipt body is {body_len} bytes, max is {}",
                cfg.max_receipt_body_bytes
            )));
        }
        if spec.parents.len() > cfg.max_receipt_parents {
            return Err(EngineError::Validation(format!(
                "receipt has {} parents, max is {}",
                spec.parents.len(),
                cfg.max_receipt_parents
            )));
        }
        if let Some(artifacts) = spec.body.get("artifacts").and_then(|v| v.as_array()) {
            if artifacts.len() > cfg.max_receipt_artifacts {
                return Err(EngineError::Validation(format!(
                    "receipt has {} artifacts, max is {}",
                    artifacts.len(),
                    cfg.max_receipt_artifacts
                )));
            }
        }

        let mut parents = spec.parents.clone();
        let mut anomaly: Option<ReceiptSpec> = None;

        if is_terminal_type(spec.receipt_type) {
            if parents.is_empty() {
                return Err(EngineError::Validation(
                    "terminal receipt requires a non-empty parents list".to_string(),
                ));
            }
            for parent_id in &parents {
                let parent_row: Option<ReceiptRow> = sqlx::query_as(
                    "SELECT * FROM receipts WHERE tenant_id = $1 AND receipt_id = $2",
                )
                .bind(tenant.0)
                .bind(parent_id.0)
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| EngineError::Internal(e.into()))?;
                let parent_row = parent_row.ok_or(EngineError::ReceiptNotFound(*parent_id))?;
                let parent_type: ReceiptType = parent_row
                    .receipt_type
                    .parse()
                    .map_err(EngineError::Validation)?;
                if !can_terminate(parent_type, spec.receipt_type) {
                    return Err(EngineError::Validation(format!(
                        "{} cannot terminate {parent_type}",
                        spec.receipt_type
                    )));
                }
            }
        }

        if spec.receipt_type == ReceiptType::TaskCompleted && !has_locatability(&spec.body) {
            match cfg.locatability_policy {
                LocatabilityPolicy::Strict => {
                    return Err(EngineError::Validation(
                        "task.completed body lacks artifacts or delivery_proof".to_string(),
                    ));
                }
                LocatabilityPolicy::Lenient => {
                    parents = vec![];
                    anomaly = Some(ReceiptSpec {
                        receipt_type: ReceiptType::SystemAnomalyLocatabilityMissing,
                        from: Principal::system(Principal::SYSTEM_LEDGER)
                            .expect("constant system id is always valid"),
                        to: spec.to.clone(),
                        task_id: spec.task_id,
                        lease_id: spec.lease_id,
                        parents: vec![],
                        body: serde_json::json!({
                            "reason": "task.completed lacked locatability",
                        }),
                    });
                }
            }
        }

        let receipt = self
            .insert_or_get(&mut *conn, tenant, spec.receipt_type, &spec.from, &spec.to, spec.task_id, spec.lease_id, &parents, spec.body)
            .await?;

        if let Some(anomaly_spec) = anomaly {
            self.insert_or_get(
                &mut *conn,
                tenant,
                anomaly_spec.receipt_type,
                &anomaly_spec.from,
                &anomaly_spec.to,
                anomaly_spec.task_id,
                anomaly_spec.lease_id,
                &anomaly_spec.parents,
                anomaly_spec.body,
            )
            .await?;
        }

        Ok(receipt)
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_or_get(
        &self,
        conn: &mut PgConnection,
        tenant: TenantId,
        receipt_type: ReceiptType,
        from: &Principal,
        to: &Principal,
        task_id: Option<crate::ids::TaskId>,
        lease_id: Option<crate::ids::LeaseId>,
        parents: &[ReceiptId],
        body: serde_json::Value,
    ) -> EngineResult<Receipt> {
        let hash = content_hash(
            receipt_type,
            task_id.map(Into::into),
            from,
            to,
            lease_id.map(Into::into),
            parents,
            &body,
        );
        let receipt_id = ReceiptId::new();
        let now = Utc::now();
        let parent_uuids: Vec<uuid::Uuid> = parents.iter().map(|p| p.0).collect();

        let row: Option<ReceiptRow> = sqlx::query_as(
            "INSERT INTO receipts (
                tenant_id, receipt_id, receipt_type, from_kind, from_id, to_kind, to_id,
                task_id, lease_id, parents, body, content_hash, created_at
             ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)
             ON CONFLICT (tenant_id, content_hash) DO NOTHING
             RETURNING *",
        )
        .bind(tenant.0)
        .bind(receipt_id.0)
        .bind(receipt_type.to_string())
        .bind(from.kind.to_string())
        .bind(&from.id)
        .bind(to.kind.to_string())
        .bind(&to.id)
        .bind(task_id.map(|t| t.0))
        .bind(lease_id.map(|l| l.0))
        .bind(&parent_uuids)
        .bind(&body)
        .bind(&hash)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| EngineError::Internal(e.into()))?;

        let row = match row {
            Some(row) => row,
            None => {
                let existing: ReceiptRow = sqlx::query_as(
                    "SELECT * FROM receipts WHERE tenant_id = $1 AND content_hash = $2",
                )
                .bind(tenant.0)
                .bind(&hash)
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| EngineError::Internal(e.into()))?;
                existing
            }
        };
        row.into_receipt()
    }

    pub async fn get(&self, tenant: TenantId, receipt_id: ReceiptId) -> EngineResult<Receipt> {
        let row: Option<ReceiptRow> =
            sqlx::query_as("SELECT * FROM receipts WHERE tenant_id = $1 AND receipt_id = $2")
                .bind(tenant.0)
                .bind(receipt_id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| EngineError::Internal(e.into()))?;
        row.ok_or(EngineError::ReceiptNotFound(receipt_id))?
            .into_receipt()
    }

    /// Most recent receipt of `receipt_type` recorded against `task_id` —
    /// used to find the `task.assigned` a discharge should parent on.
    pub async fn latest_of_type_for_task(
        &self,
        tenant: TenantId,
        task_id: crate::ids::TaskId,
        receipt_type: ReceiptType,
    ) -> EngineResult<Option<Receipt>> {
        let row: Option<ReceiptRow> = sqlx::query_as(
            "SELECT * FROM receipts
             WHERE tenant_id = $1 AND task_id = $2 AND receipt_type = $3
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(tenant.0)
        .bind(task_id.0)
        .bind(receipt_type.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::Internal(e.into()))?;
        row.map(ReceiptRow::into_receipt).transpose()
    }

    /// Cursor-paginated by `(created_at, receipt_id)`, filtered by
    /// `task_id` and/or `receipt_type` — the agent-facing `list_receipts`
    /// operation (spec §6), independent of the obligation-candidate scan
    /// `list_addressed_obligation_candidates` runs for bootstrap.
    pub async fn list(
        &self,
        tenant: TenantId,
        filter: &crate::model::ReceiptFilter,
        cursor: Option<(DateTime<Utc>, uuid::Uuid)>,
        limit: i64,
    ) -> EngineResult<Vec<Receipt>> {
        let (after_ts, after_id) = cursor.unzip();
        let rows: Vec<ReceiptRow> = sqlx::query_as(
            "SELECT * FROM receipts
             WHERE tenant_id = $1
               AND ($2::uuid IS NULL OR task_id = $2)
               AND ($3::text IS NULL OR receipt_type = $3)
               AND ($4::timestamptz IS NULL OR (created_at, receipt_id) > ($4, $5))
             ORDER BY created_at ASC, receipt_id ASC
             LIMIT $6",
        )
        .bind(tenant.0)
        .bind(filter.task_id.map(|t| t.0))
        .bind(filter.receipt_type.map(|t| t.to_string()))
        .bind(after_ts)
        .bind(after_id.unwrap_or(uuid::Uuid::nil()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Internal(e.into()))?;
        rows.into_iter().map(ReceiptRow::into_receipt).collect()
    }

    pub async fn list_by_parent(
        &self,
        tenant: TenantId,
        parent_id: ReceiptId,
        limit: i64,
    ) -> EngineResult<Vec<Receipt>> {
        let rows: Vec<ReceiptRow> = sqlx::query_as(
            "SELECT * FROM receipts
             WHERE tenant_id = $1 AND parents @> ARRAY[$2]::uuid[]
             ORDER BY created_at ASC
             LIMIT $3",
        )
        .bind(tenant.0)
        .bind(parent_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Internal(e.into()))?;
        rows.into_iter().map(ReceiptRow::into_receipt).collect()
    }

    /// Constant-time existence probe against the inverted `parents` index —
    /// the hot path `ObligationQuery` relies on. Only children whose type is
    /// actually in `terminal_types()` count: a `receipt.acknowledged` parented
    /// on a `task.assigned` must never read as discharging it (I7).
    pub async fn has_terminator(&self, tenant: TenantId, parent_id: ReceiptId) -> EngineResult<bool> {
        let terminal: Vec<String> = terminal_types().iter().map(ToString::to_string).collect();
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS(
                SELECT 1 FROM receipts
                WHERE tenant_id = $1 AND parents @> ARRAY[$2]::uuid[]
                  AND receipt_type = ANY($3)
             )",
        )
        .bind(tenant.0)
        .bind(parent_id.0)
        .bind(&terminal)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| EngineError::Internal(e.into()))?;
        Ok(row.0)
    }

    pub async fn get_latest_terminator(
        &self,
        tenant: TenantId,
        parent_id: ReceiptId,
    ) -> EngineResult<Option<Receipt>> {
        let terminal: Vec<String> = terminal_types().iter().map(ToString::to_string).collect();
        let row: Option<ReceiptRow> = sqlx::query_as(
            "SELECT * FROM receipts
             WHERE tenant_id = $1 AND parents @> ARRAY[$2]::uuid[]
               AND receipt_type = ANY($3)
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(tenant.0)
        .bind(parent_id.0)
        .bind(&terminal)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::Internal(e.into()))?;
        row.map(ReceiptRow::into_receipt).transpose()
    }

    /// Cursor-paginated candidates for `ObligationQuery`: receipts of
    /// `receipt_type` addressed to `principal`, oldest first. Filtering
    /// against which of these already have a terminating child happens
    /// separately via [`ReceiptLedger::terminated_subset`].
    pub async fn list_addressed_obligation_candidates(
        &self,
        tenant: TenantId,
        principal: &Principal,
        receipt_type: ReceiptType,
        cursor: Option<(DateTime<Utc>, uuid::Uuid)>,
        limit: i64,
    ) -> EngineResult<Vec<Receipt>> {
        let (after_ts, after_id) = cursor.unzip();
        let rows: Vec<ReceiptRow> = sqlx::query_as(
            "SELECT * FROM receipts
             WHERE tenant_id = $1 AND receipt_type = $2 AND to_kind = $3 AND to_id = $4
               AND ($5::timestamptz IS NULL OR (created_at, receipt_id) > ($5, $6))
             ORDER BY created_at ASC, receipt_id ASC
             LIMIT $7",
        )
        .bind(tenant.0)
        .bind(receipt_type.to_string())
        .bind(principal.kind.to_string())
        .bind(&principal.id)
        .bind(after_ts)
        .bind(after_id.unwrap_or(uuid::Uuid::nil()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Internal(e.into()))?;
        rows.into_iter().map(ReceiptRow::into_receipt).collect()
    }

    /// Batched termination probe for `ObligationQuery`: given a set of
    /// candidate parent ids, returns the subset that already has a
    /// terminating child — one query instead of one-probe-per-candidate.
    /// Only rows whose `receipt_type` is in `terminal_types()` are fetched,
    /// so a merely-acknowledging child can never count as a terminator (I7).
    pub async fn terminated_subset(
        &self,
        tenant: TenantId,
        candidate_ids: &[ReceiptId],
    ) -> EngineResult<std::collections::HashSet<ReceiptId>> {
        if candidate_ids.is_empty() {
            return Ok(std::collections::HashSet::new());
        }
        let candidates: Vec<uuid::Uuid> = candidate_ids.iter().map(|c| c.0).collect();
        let terminal: Vec<String> = terminal_types().iter().map(ToString::to_string).collect();
        let rows: Vec<(Vec<uuid::Uuid>,)> = sqlx::query_as(
            "SELECT parents FROM receipts
             WHERE tenant_id = $1 AND parents && $2::uuid[] AND receipt_type = ANY($3)",
        )
        .bind(tenant.0)
        .bind(&candidates)
        .bind(&terminal)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Internal(e.into()))?;

        let candidate_set: std::collections::HashSet<uuid::Uuid> = candidates.into_iter().collect();
        let mut terminated = std::collections::HashSet::new();
        for (parents,) in rows {
            for p in parents {
                if candidate_set.contains(&p) {
                    terminated.insert(ReceiptId::from_uuid(p));
                }
            }
        }
        Ok(terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(id: &str) -> Principal {
        Principal::agent(id).unwrap()
    }

    #[test]
    fn hash_differs_when_only_parents_differ() {
        let body = serde_json::json!({"artifacts": [{"type": "mem", "key": "k1"}]});
        let task_id = uuid::Uuid::new_v4();
        let from = principal("worker-1");
        let to = principal("agent-1");
        let parent_a = ReceiptId::new();
        let parent_b = ReceiptId::new();

        let hash_a = content_hash(
            ReceiptType::TaskCompleted,
            Some(task_id),
            &from,
            &to,
            None,
            &[parent_a],
            &body,
        );
        let hash_b = content_hash(
            ReceiptType::TaskCompleted,
            Some(task_id),
            &from,
            &to,
            None,
            &[parent_b],
            &body,
        );
        assert_ne!(hash_a, hash_b);
    }

    #[test]
    fn hash_is_stable_regardless_of_parents_input_order() {
        let body = serde_json::json!({"artifacts": []});
        let task_id = uuid::Uuid::new_v4();
        let from = principal("worker-1");
        let to = principal("agent-1");
        let p1 = ReceiptId::new();
        let p2 = ReceiptId::new();

        let forward = content_hash(
            ReceiptType::TaskCompleted,
            Some(task_id),
            &from,
            &to,
            None,
            &[p1, p2],
            &body,
        );
        let backward = content_hash(
            ReceiptType::TaskCompleted,
            Some(task_id),
            &from,
            &to,
            None,
            &[p2, p1],
            &body,
        );
        assert_eq!(forward, backward);
    }

    #[test]
    fn locatability_detects_either_artifacts_or_delivery_proof() {
        assert!(has_locatability(&serde_json::json!({"artifacts": [1]})));
        assert!(has_locatability(&serde_json::json!({"delivery_proof": {}})));
        assert!(!has_locatability(&serde_json::json!({"msg": "hi"})));
    }
}
