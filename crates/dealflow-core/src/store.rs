use crate::error::DealflowError;
use crate::types::{
    Deal, DealStatus, DebitOutcome, Deliverable, DeliverableStatus, GateProgress,
    GateProgressStatus, JourneyType, WalletTransaction,
};
use crate::wallet::build_transaction;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Persistence backend configuration.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    /// Keep all state in process memory only.
    Memory,
    /// Persist all state in PostgreSQL.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// A debit to settle inside the advance boundary.
#[derive(Debug, Clone)]
pub struct ChargeSpec {
    pub user_id: String,
    pub amount_minor: u64,
    pub description: String,
}

/// Storage-level outcome of the atomic gate-advance commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitAdvance {
    Advanced,
    /// The deal was not at the expected gate; nothing was written.
    StaleGate { actual: String },
    /// The charge could not be covered; nothing was written.
    InsufficientFunds { balance_minor: u64 },
}

#[derive(Default)]
struct MemoryState {
    deals: HashMap<String, Deal>,
    wallets: HashMap<String, u64>,
    transactions: Vec<WalletTransaction>,
    progress: BTreeMap<(String, String), GateProgress>,
    deliverables: HashMap<String, Deliverable>,
}

impl MemoryState {
    /// Append a hash-chained transaction for `user_id`. Callers hold the
    /// state lock, which serializes chain-head reads with the append.
    fn append_transaction(
        &mut self,
        user_id: &str,
        amount_minor: i64,
        description: &str,
        deal_id: Option<&str>,
    ) {
        let tail = self
            .transactions
            .iter()
            .filter(|txn| txn.user_id == user_id)
            .last();
        let chain_index = tail.map(|txn| txn.chain_index + 1).unwrap_or(0);
        let previous_hash = tail.map(|txn| txn.entry_hash.clone());
        self.transactions.push(build_transaction(
            user_id,
            chain_index,
            amount_minor,
            description,
            deal_id,
            previous_hash.as_deref(),
        ));
    }

    fn debit(
        &mut self,
        user_id: &str,
        amount_minor: u64,
        description: &str,
        deal_id: Option<&str>,
    ) -> DebitOutcome {
        let balance = self.wallets.get(user_id).copied().unwrap_or(0);
        if balance < amount_minor {
            return DebitOutcome::InsufficientFunds {
                balance_minor: balance,
            };
        }
        let new_balance = balance - amount_minor;
        self.wallets.insert(user_id.to_string(), new_balance);
        self.append_transaction(user_id, -(amount_minor as i64), description, deal_id);
        DebitOutcome::Applied {
            new_balance_minor: new_balance,
        }
    }

    fn upsert_progress(
        &mut self,
        deal_id: &str,
        gate_id: &str,
        status: GateProgressStatus,
        now: DateTime<Utc>,
    ) {
        let key = (deal_id.to_string(), gate_id.to_string());
        let entry = self.progress.entry(key).or_insert_with(|| GateProgress {
            deal_id: deal_id.to_string(),
            gate_id: gate_id.to_string(),
            status: GateProgressStatus::Pending,
            entered_at: None,
            completed_at: None,
        });
        entry.status = status;
        match status {
            GateProgressStatus::Active => {
                if entry.entered_at.is_none() {
                    entry.entered_at = Some(now);
                }
            }
            GateProgressStatus::Completed => {
                entry.completed_at = Some(now);
            }
            GateProgressStatus::Pending => {}
        }
    }
}

#[derive(Clone)]
enum Backend {
    Memory(Arc<Mutex<MemoryState>>),
    Postgres(PgPool),
}

/// Deal, wallet, progress, and deliverable storage.
///
/// The memory backend performs every race-sensitive mutation under a single
/// lock section; the Postgres backend uses single conditional `UPDATE`s (or
/// one transaction for the advance boundary) so at-most-once semantics hold
/// across processes.
#[derive(Clone)]
pub struct DealStore {
    backend: Backend,
}

impl DealStore {
    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(Mutex::new(MemoryState::default()))),
        }
    }

    pub async fn bootstrap(config: StoreConfig) -> Result<Self, DealflowError> {
        match config {
            StoreConfig::Memory => Ok(Self::memory()),
            StoreConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let pool = PgPoolOptions::new()
                    .max_connections(max_connections.max(1))
                    .connect(&database_url)
                    .await
                    .map_err(|e| DealflowError::Storage(format!("postgres connect failed: {e}")))?;
                let store = Self {
                    backend: Backend::Postgres(pool),
                };
                store.ensure_schema().await?;
                Ok(store)
            }
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match self.backend {
            Backend::Memory(_) => "memory",
            Backend::Postgres(_) => "postgres",
        }
    }

    // ---- deals ----

    /// Insert a new deal and an active progress row for its first gate.
    pub async fn insert_deal(&self, deal: &Deal) -> Result<(), DealflowError> {
        match &self.backend {
            Backend::Memory(state) => {
                let mut state = state.lock().await;
                state.deals.insert(deal.deal_id.clone(), deal.clone());
                state.upsert_progress(
                    &deal.deal_id,
                    &deal.current_gate,
                    GateProgressStatus::Active,
                    deal.created_at,
                );
                Ok(())
            }
            Backend::Postgres(pool) => {
                let attributes = serde_json::to_value(&deal.attributes)
                    .map_err(|e| DealflowError::Serialization(e.to_string()))?;
                sqlx::query(
                    r#"
                    INSERT INTO deals (
                        deal_id, owner_id, journey, current_gate, status,
                        attributes, created_at, updated_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(&deal.deal_id)
                .bind(&deal.owner_id)
                .bind(deal.journey.name())
                .bind(&deal.current_gate)
                .bind(status_to_str(deal.status))
                .bind(&attributes)
                .bind(deal.created_at)
                .bind(deal.updated_at)
                .execute(pool)
                .await
                .map_err(|e| DealflowError::Storage(format!("deal insert failed: {e}")))?;

                sqlx::query(
                    r#"
                    INSERT INTO gate_progress (deal_id, gate_id, status, entered_at)
                    VALUES ($1, $2, 'active', $3)
                    ON CONFLICT (deal_id, gate_id) DO NOTHING
                    "#,
                )
                .bind(&deal.deal_id)
                .bind(&deal.current_gate)
                .bind(deal.created_at)
                .execute(pool)
                .await
                .map_err(|e| DealflowError::Storage(format!("progress insert failed: {e}")))?;
                Ok(())
            }
        }
    }

    pub async fn deal(&self, deal_id: &str) -> Result<Deal, DealflowError> {
        match &self.backend {
            Backend::Memory(state) => state
                .lock()
                .await
                .deals
                .get(deal_id)
                .cloned()
                .ok_or_else(|| DealflowError::UnknownDeal(deal_id.to_string())),
            Backend::Postgres(pool) => {
                let row = sqlx::query("SELECT * FROM deals WHERE deal_id = $1")
                    .bind(deal_id)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| DealflowError::Storage(format!("deal fetch failed: {e}")))?
                    .ok_or_else(|| DealflowError::UnknownDeal(deal_id.to_string()))?;
                deal_from_row(&row)
            }
        }
    }

    /// Merge attribute updates into the deal's bag, last-writer-wins per key.
    pub async fn merge_attributes(
        &self,
        deal_id: &str,
        partial: BTreeMap<String, Value>,
    ) -> Result<Deal, DealflowError> {
        match &self.backend {
            Backend::Memory(state) => {
                let mut state = state.lock().await;
                let deal = state
                    .deals
                    .get_mut(deal_id)
                    .ok_or_else(|| DealflowError::UnknownDeal(deal_id.to_string()))?;
                deal.attributes.extend(partial);
                deal.updated_at = Utc::now();
                Ok(deal.clone())
            }
            Backend::Postgres(pool) => {
                let patch = serde_json::to_value(&partial)
                    .map_err(|e| DealflowError::Serialization(e.to_string()))?;
                let row = sqlx::query(
                    r#"
                    UPDATE deals
                    SET attributes = attributes || $2, updated_at = $3
                    WHERE deal_id = $1
                    RETURNING *
                    "#,
                )
                .bind(deal_id)
                .bind(&patch)
                .bind(Utc::now())
                .fetch_optional(pool)
                .await
                .map_err(|e| DealflowError::Storage(format!("attribute merge failed: {e}")))?
                .ok_or_else(|| DealflowError::UnknownDeal(deal_id.to_string()))?;
                deal_from_row(&row)
            }
        }
    }

    pub async fn close_deal(&self, deal_id: &str) -> Result<(), DealflowError> {
        match &self.backend {
            Backend::Memory(state) => {
                let mut state = state.lock().await;
                let deal = state
                    .deals
                    .get_mut(deal_id)
                    .ok_or_else(|| DealflowError::UnknownDeal(deal_id.to_string()))?;
                deal.status = DealStatus::Closed;
                deal.updated_at = Utc::now();
                Ok(())
            }
            Backend::Postgres(pool) => {
                let result =
                    sqlx::query("UPDATE deals SET status = 'closed', updated_at = $2 WHERE deal_id = $1")
                        .bind(deal_id)
                        .bind(Utc::now())
                        .execute(pool)
                        .await
                        .map_err(|e| DealflowError::Storage(format!("deal close failed: {e}")))?;
                if result.rows_affected() == 0 {
                    return Err(DealflowError::UnknownDeal(deal_id.to_string()));
                }
                Ok(())
            }
        }
    }

    pub async fn gate_progress(&self, deal_id: &str) -> Result<Vec<GateProgress>, DealflowError> {
        match &self.backend {
            Backend::Memory(state) => Ok(state
                .lock()
                .await
                .progress
                .values()
                .filter(|progress| progress.deal_id == deal_id)
                .cloned()
                .collect()),
            Backend::Postgres(pool) => {
                let rows = sqlx::query(
                    "SELECT * FROM gate_progress WHERE deal_id = $1 ORDER BY entered_at ASC NULLS LAST",
                )
                .bind(deal_id)
                .fetch_all(pool)
                .await
                .map_err(|e| DealflowError::Storage(format!("progress fetch failed: {e}")))?;
                rows.iter().map(progress_from_row).collect()
            }
        }
    }

    // ---- wallet ----

    pub async fn balance(&self, user_id: &str) -> Result<u64, DealflowError> {
        match &self.backend {
            Backend::Memory(state) => {
                Ok(state.lock().await.wallets.get(user_id).copied().unwrap_or(0))
            }
            Backend::Postgres(pool) => {
                let row =
                    sqlx::query("SELECT balance_minor FROM wallets WHERE user_id = $1")
                        .bind(user_id)
                        .fetch_optional(pool)
                        .await
                        .map_err(|e| DealflowError::Storage(format!("balance fetch failed: {e}")))?;
                match row {
                    Some(row) => decode_balance(&row),
                    None => Ok(0),
                }
            }
        }
    }

    /// Atomically increment the balance and append a ledger entry.
    pub async fn credit(
        &self,
        user_id: &str,
        amount_minor: u64,
        description: &str,
    ) -> Result<u64, DealflowError> {
        match &self.backend {
            Backend::Memory(state) => {
                let mut state = state.lock().await;
                let balance = state.wallets.entry(user_id.to_string()).or_insert(0);
                *balance = balance.saturating_add(amount_minor);
                let new_balance = *balance;
                state.append_transaction(user_id, amount_minor as i64, description, None);
                Ok(new_balance)
            }
            Backend::Postgres(pool) => {
                let mut tx = pool
                    .begin()
                    .await
                    .map_err(|e| DealflowError::Storage(format!("credit begin failed: {e}")))?;
                let row = sqlx::query(
                    r#"
                    INSERT INTO wallets (user_id, balance_minor)
                    VALUES ($1, $2)
                    ON CONFLICT (user_id)
                    DO UPDATE SET balance_minor = wallets.balance_minor + $2
                    RETURNING balance_minor
                    "#,
                )
                .bind(user_id)
                .bind(amount_minor as i64)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| DealflowError::Storage(format!("credit failed: {e}")))?;
                append_transaction_pg(&mut tx, user_id, amount_minor as i64, description, None)
                    .await?;
                tx.commit()
                    .await
                    .map_err(|e| DealflowError::Storage(format!("credit commit failed: {e}")))?;
                decode_balance(&row)
            }
        }
    }

    /// Atomic check-and-debit: decrement and append the ledger entry in one
    /// indivisible unit, or report the shortfall with no mutation. Two
    /// concurrent debits for the same user can never both succeed past the
    /// balance.
    pub async fn debit(
        &self,
        user_id: &str,
        amount_minor: u64,
        description: &str,
        deal_id: Option<&str>,
    ) -> Result<DebitOutcome, DealflowError> {
        match &self.backend {
            Backend::Memory(state) => {
                let mut state = state.lock().await;
                Ok(state.debit(user_id, amount_minor, description, deal_id))
            }
            Backend::Postgres(pool) => {
                let mut tx = pool
                    .begin()
                    .await
                    .map_err(|e| DealflowError::Storage(format!("debit begin failed: {e}")))?;
                let outcome =
                    debit_pg(&mut tx, user_id, amount_minor, description, deal_id).await?;
                match outcome {
                    DebitOutcome::Applied { .. } => {
                        tx.commit().await.map_err(|e| {
                            DealflowError::Storage(format!("debit commit failed: {e}"))
                        })?;
                    }
                    DebitOutcome::InsufficientFunds { .. } => {
                        // Nothing was written; drop the transaction.
                    }
                }
                Ok(outcome)
            }
        }
    }

    pub async fn transactions(
        &self,
        user_id: &str,
    ) -> Result<Vec<WalletTransaction>, DealflowError> {
        match &self.backend {
            Backend::Memory(state) => Ok(state
                .lock()
                .await
                .transactions
                .iter()
                .filter(|txn| txn.user_id == user_id)
                .cloned()
                .collect()),
            Backend::Postgres(pool) => {
                let rows = sqlx::query(
                    "SELECT * FROM wallet_transactions WHERE user_id = $1 ORDER BY chain_index ASC",
                )
                .bind(user_id)
                .fetch_all(pool)
                .await
                .map_err(|e| DealflowError::Storage(format!("transactions fetch failed: {e}")))?;
                rows.iter().map(transaction_from_row).collect()
            }
        }
    }

    // ---- advance boundary ----

    /// The gate-advance commit: conditional gate move, optional debit with
    /// ledger append, and both progress rows, all-or-nothing. A persistence
    /// failure after the debit rolls the debit back with it.
    pub async fn commit_advance(
        &self,
        deal_id: &str,
        from_gate: &str,
        to_gate: &str,
        charge: Option<ChargeSpec>,
    ) -> Result<CommitAdvance, DealflowError> {
        let now = Utc::now();
        match &self.backend {
            Backend::Memory(state) => {
                let mut state = state.lock().await;
                let actual = match state.deals.get(deal_id) {
                    Some(deal) => deal.current_gate.clone(),
                    None => return Err(DealflowError::UnknownDeal(deal_id.to_string())),
                };
                if actual != from_gate {
                    return Ok(CommitAdvance::StaleGate { actual });
                }
                if let Some(charge) = &charge {
                    match state.debit(
                        &charge.user_id,
                        charge.amount_minor,
                        &charge.description,
                        Some(deal_id),
                    ) {
                        DebitOutcome::Applied { .. } => {}
                        DebitOutcome::InsufficientFunds { balance_minor } => {
                            return Ok(CommitAdvance::InsufficientFunds { balance_minor });
                        }
                    }
                }
                if let Some(deal) = state.deals.get_mut(deal_id) {
                    deal.current_gate = to_gate.to_string();
                    deal.updated_at = now;
                }
                state.upsert_progress(deal_id, from_gate, GateProgressStatus::Completed, now);
                state.upsert_progress(deal_id, to_gate, GateProgressStatus::Active, now);
                Ok(CommitAdvance::Advanced)
            }
            Backend::Postgres(pool) => {
                let mut tx = pool
                    .begin()
                    .await
                    .map_err(|e| DealflowError::Storage(format!("advance begin failed: {e}")))?;

                // The conditional gate move doubles as the stale-state check.
                let moved = sqlx::query(
                    r#"
                    UPDATE deals
                    SET current_gate = $3, updated_at = $4
                    WHERE deal_id = $1 AND current_gate = $2
                    "#,
                )
                .bind(deal_id)
                .bind(from_gate)
                .bind(to_gate)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| DealflowError::Storage(format!("gate move failed: {e}")))?;

                if moved.rows_affected() == 0 {
                    let row = sqlx::query("SELECT current_gate FROM deals WHERE deal_id = $1")
                        .bind(deal_id)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(|e| DealflowError::Storage(format!("gate fetch failed: {e}")))?
                        .ok_or_else(|| DealflowError::UnknownDeal(deal_id.to_string()))?;
                    let actual: String = row
                        .try_get("current_gate")
                        .map_err(|e| DealflowError::Storage(format!("decode failed: {e}")))?;
                    return Ok(CommitAdvance::StaleGate { actual });
                }

                if let Some(charge) = &charge {
                    match debit_pg(
                        &mut tx,
                        &charge.user_id,
                        charge.amount_minor,
                        &charge.description,
                        Some(deal_id),
                    )
                    .await?
                    {
                        DebitOutcome::Applied { .. } => {}
                        DebitOutcome::InsufficientFunds { balance_minor } => {
                            // Dropping the transaction rolls back the gate move.
                            return Ok(CommitAdvance::InsufficientFunds { balance_minor });
                        }
                    }
                }

                sqlx::query(
                    r#"
                    INSERT INTO gate_progress (deal_id, gate_id, status, entered_at, completed_at)
                    VALUES ($1, $2, 'completed', $3, $3)
                    ON CONFLICT (deal_id, gate_id)
                    DO UPDATE SET status = 'completed', completed_at = $3
                    "#,
                )
                .bind(deal_id)
                .bind(from_gate)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| DealflowError::Storage(format!("progress update failed: {e}")))?;

                sqlx::query(
                    r#"
                    INSERT INTO gate_progress (deal_id, gate_id, status, entered_at)
                    VALUES ($1, $2, 'active', $3)
                    ON CONFLICT (deal_id, gate_id)
                    DO UPDATE SET status = 'active',
                        entered_at = COALESCE(gate_progress.entered_at, $3)
                    "#,
                )
                .bind(deal_id)
                .bind(to_gate)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| DealflowError::Storage(format!("progress update failed: {e}")))?;

                tx.commit()
                    .await
                    .map_err(|e| DealflowError::Storage(format!("advance commit failed: {e}")))?;
                Ok(CommitAdvance::Advanced)
            }
        }
    }

    // ---- deliverables ----

    pub async fn insert_deliverable(&self, deliverable: &Deliverable) -> Result<(), DealflowError> {
        match &self.backend {
            Backend::Memory(state) => {
                state
                    .lock()
                    .await
                    .deliverables
                    .insert(deliverable.deliverable_id.clone(), deliverable.clone());
                Ok(())
            }
            Backend::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO deliverables (
                        deliverable_id, deal_id, user_id, slug, status, requested_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(&deliverable.deliverable_id)
                .bind(&deliverable.deal_id)
                .bind(&deliverable.user_id)
                .bind(&deliverable.slug)
                .bind(deliverable.status.as_str())
                .bind(deliverable.requested_at)
                .execute(pool)
                .await
                .map_err(|e| DealflowError::Storage(format!("deliverable insert failed: {e}")))?;
                Ok(())
            }
        }
    }

    pub async fn deliverable(&self, deliverable_id: &str) -> Result<Deliverable, DealflowError> {
        match &self.backend {
            Backend::Memory(state) => state
                .lock()
                .await
                .deliverables
                .get(deliverable_id)
                .cloned()
                .ok_or_else(|| DealflowError::UnknownDeliverable(deliverable_id.to_string())),
            Backend::Postgres(pool) => {
                let row = sqlx::query("SELECT * FROM deliverables WHERE deliverable_id = $1")
                    .bind(deliverable_id)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| DealflowError::Storage(format!("deliverable fetch failed: {e}")))?
                    .ok_or_else(|| DealflowError::UnknownDeliverable(deliverable_id.to_string()))?;
                deliverable_from_row(&row)
            }
        }
    }

    /// The claim guard: `queued -> generating` as one conditional update.
    /// Returns `true` for exactly one caller; every concurrent or repeated
    /// attempt sees `false`.
    pub async fn claim_deliverable(&self, deliverable_id: &str) -> Result<bool, DealflowError> {
        match &self.backend {
            Backend::Memory(state) => {
                let mut state = state.lock().await;
                match state.deliverables.get_mut(deliverable_id) {
                    Some(deliverable) if deliverable.status == DeliverableStatus::Queued => {
                        deliverable.status = DeliverableStatus::Generating;
                        Ok(true)
                    }
                    Some(_) => Ok(false),
                    None => Err(DealflowError::UnknownDeliverable(deliverable_id.to_string())),
                }
            }
            Backend::Postgres(pool) => {
                let result = sqlx::query(
                    "UPDATE deliverables SET status = 'generating' WHERE deliverable_id = $1 AND status = 'queued'",
                )
                .bind(deliverable_id)
                .execute(pool)
                .await
                .map_err(|e| DealflowError::Storage(format!("claim failed: {e}")))?;
                Ok(result.rows_affected() == 1)
            }
        }
    }

    pub async fn complete_deliverable(
        &self,
        deliverable_id: &str,
        content: Value,
        generation_ms: u64,
    ) -> Result<(), DealflowError> {
        self.finish_deliverable(
            deliverable_id,
            DeliverableStatus::Complete,
            Some(content),
            None,
            generation_ms,
        )
        .await
    }

    pub async fn fail_deliverable(
        &self,
        deliverable_id: &str,
        error_detail: &str,
        generation_ms: u64,
    ) -> Result<(), DealflowError> {
        self.finish_deliverable(
            deliverable_id,
            DeliverableStatus::Failed,
            None,
            Some(error_detail.to_string()),
            generation_ms,
        )
        .await
    }

    /// Explicit external reset: `failed -> queued` so the record can be
    /// reclaimed. Returns `false` when the record is not in `failed`.
    pub async fn requeue_failed(&self, deliverable_id: &str) -> Result<bool, DealflowError> {
        match &self.backend {
            Backend::Memory(state) => {
                let mut state = state.lock().await;
                match state.deliverables.get_mut(deliverable_id) {
                    Some(deliverable) if deliverable.status == DeliverableStatus::Failed => {
                        deliverable.status = DeliverableStatus::Queued;
                        deliverable.error_detail = None;
                        deliverable.completed_at = None;
                        deliverable.generation_ms = None;
                        Ok(true)
                    }
                    Some(_) => Ok(false),
                    None => Err(DealflowError::UnknownDeliverable(deliverable_id.to_string())),
                }
            }
            Backend::Postgres(pool) => {
                let result = sqlx::query(
                    r#"
                    UPDATE deliverables
                    SET status = 'queued', error_detail = NULL,
                        completed_at = NULL, generation_ms = NULL
                    WHERE deliverable_id = $1 AND status = 'failed'
                    "#,
                )
                .bind(deliverable_id)
                .execute(pool)
                .await
                .map_err(|e| DealflowError::Storage(format!("requeue failed: {e}")))?;
                Ok(result.rows_affected() == 1)
            }
        }
    }

    /// Oldest-first queued deliverables for the background poller.
    pub async fn queued_deliverables(&self, limit: usize) -> Result<Vec<Deliverable>, DealflowError> {
        match &self.backend {
            Backend::Memory(state) => {
                let state = state.lock().await;
                let mut queued: Vec<Deliverable> = state
                    .deliverables
                    .values()
                    .filter(|deliverable| deliverable.status == DeliverableStatus::Queued)
                    .cloned()
                    .collect();
                queued.sort_by_key(|deliverable| deliverable.requested_at);
                queued.truncate(limit);
                Ok(queued)
            }
            Backend::Postgres(pool) => {
                let rows = sqlx::query(
                    "SELECT * FROM deliverables WHERE status = 'queued' ORDER BY requested_at ASC LIMIT $1",
                )
                .bind(limit as i64)
                .fetch_all(pool)
                .await
                .map_err(|e| DealflowError::Storage(format!("queued fetch failed: {e}")))?;
                rows.iter().map(deliverable_from_row).collect()
            }
        }
    }

    async fn finish_deliverable(
        &self,
        deliverable_id: &str,
        status: DeliverableStatus,
        content: Option<Value>,
        error_detail: Option<String>,
        generation_ms: u64,
    ) -> Result<(), DealflowError> {
        let now = Utc::now();
        match &self.backend {
            Backend::Memory(state) => {
                let mut state = state.lock().await;
                // Terminal writes only land on a claimed record, matching the
                // conditional update on the Postgres path.
                let deliverable = state
                    .deliverables
                    .get_mut(deliverable_id)
                    .filter(|deliverable| deliverable.status == DeliverableStatus::Generating)
                    .ok_or_else(|| DealflowError::UnknownDeliverable(deliverable_id.to_string()))?;
                deliverable.status = status;
                deliverable.content = content;
                deliverable.error_detail = error_detail;
                deliverable.generation_ms = Some(generation_ms);
                deliverable.completed_at = Some(now);
                Ok(())
            }
            Backend::Postgres(pool) => {
                let result = sqlx::query(
                    r#"
                    UPDATE deliverables
                    SET status = $2, content = $3, error_detail = $4,
                        generation_ms = $5, completed_at = $6
                    WHERE deliverable_id = $1 AND status = 'generating'
                    "#,
                )
                .bind(deliverable_id)
                .bind(status.as_str())
                .bind(&content)
                .bind(&error_detail)
                .bind(generation_ms as i64)
                .bind(now)
                .execute(pool)
                .await
                .map_err(|e| DealflowError::Storage(format!("finish failed: {e}")))?;
                if result.rows_affected() == 0 {
                    return Err(DealflowError::UnknownDeliverable(deliverable_id.to_string()));
                }
                Ok(())
            }
        }
    }

    async fn ensure_schema(&self) -> Result<(), DealflowError> {
        let Backend::Postgres(pool) = &self.backend else {
            return Ok(());
        };

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS deals (
                deal_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                journey TEXT NOT NULL,
                current_gate TEXT NOT NULL,
                status TEXT NOT NULL,
                attributes JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS gate_progress (
                deal_id TEXT NOT NULL,
                gate_id TEXT NOT NULL,
                status TEXT NOT NULL,
                entered_at TIMESTAMPTZ NULL,
                completed_at TIMESTAMPTZ NULL,
                PRIMARY KEY (deal_id, gate_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS wallets (
                user_id TEXT PRIMARY KEY,
                balance_minor BIGINT NOT NULL CHECK (balance_minor >= 0)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS wallet_transactions (
                txn_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                chain_index BIGINT NOT NULL,
                amount_minor BIGINT NOT NULL,
                description TEXT NOT NULL,
                deal_id TEXT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                previous_hash TEXT NULL,
                entry_hash TEXT NOT NULL,
                UNIQUE (user_id, chain_index)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS deliverables (
                deliverable_id TEXT PRIMARY KEY,
                deal_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                slug TEXT NOT NULL,
                status TEXT NOT NULL,
                content JSONB NULL,
                error_detail TEXT NULL,
                generation_ms BIGINT NULL,
                requested_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_deliverables_status ON deliverables (status, requested_at)",
            "CREATE INDEX IF NOT EXISTS idx_wallet_txns_user ON wallet_transactions (user_id, chain_index)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(pool)
                .await
                .map_err(|e| DealflowError::Storage(format!("schema create failed: {e}")))?;
        }
        Ok(())
    }
}

/// Conditional debit inside an open transaction. The wallet row update locks
/// the row, which also serializes the per-user hash-chain append behind it.
async fn debit_pg(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: &str,
    amount_minor: u64,
    description: &str,
    deal_id: Option<&str>,
) -> Result<DebitOutcome, DealflowError> {
    let row = sqlx::query(
        r#"
        UPDATE wallets
        SET balance_minor = balance_minor - $2
        WHERE user_id = $1 AND balance_minor >= $2
        RETURNING balance_minor
        "#,
    )
    .bind(user_id)
    .bind(amount_minor as i64)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| DealflowError::Storage(format!("debit failed: {e}")))?;

    match row {
        Some(row) => {
            let new_balance = decode_balance(&row)?;
            append_transaction_pg(tx, user_id, -(amount_minor as i64), description, deal_id)
                .await?;
            Ok(DebitOutcome::Applied {
                new_balance_minor: new_balance,
            })
        }
        None => {
            let row = sqlx::query("SELECT balance_minor FROM wallets WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| DealflowError::Storage(format!("balance fetch failed: {e}")))?;
            let balance_minor = match row {
                Some(row) => decode_balance(&row)?,
                None => 0,
            };
            Ok(DebitOutcome::InsufficientFunds { balance_minor })
        }
    }
}

async fn append_transaction_pg(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: &str,
    amount_minor: i64,
    description: &str,
    deal_id: Option<&str>,
) -> Result<(), DealflowError> {
    let tail = sqlx::query(
        "SELECT chain_index, entry_hash FROM wallet_transactions WHERE user_id = $1 ORDER BY chain_index DESC LIMIT 1",
    )
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| DealflowError::Storage(format!("chain tail fetch failed: {e}")))?;

    let (chain_index, previous_hash) = match tail {
        Some(row) => {
            let index: i64 = row
                .try_get("chain_index")
                .map_err(|e| DealflowError::Storage(format!("decode failed: {e}")))?;
            let hash: String = row
                .try_get("entry_hash")
                .map_err(|e| DealflowError::Storage(format!("decode failed: {e}")))?;
            (index as u64 + 1, Some(hash))
        }
        None => (0, None),
    };

    let txn = build_transaction(
        user_id,
        chain_index,
        amount_minor,
        description,
        deal_id,
        previous_hash.as_deref(),
    );

    sqlx::query(
        r#"
        INSERT INTO wallet_transactions (
            txn_id, user_id, chain_index, amount_minor, description,
            deal_id, created_at, previous_hash, entry_hash
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(&txn.txn_id)
    .bind(&txn.user_id)
    .bind(txn.chain_index as i64)
    .bind(txn.amount_minor)
    .bind(&txn.description)
    .bind(&txn.deal_id)
    .bind(txn.created_at)
    .bind(&txn.previous_hash)
    .bind(&txn.entry_hash)
    .execute(&mut **tx)
    .await
    .map_err(|e| DealflowError::Storage(format!("transaction insert failed: {e}")))?;
    Ok(())
}

fn status_to_str(status: DealStatus) -> &'static str {
    match status {
        DealStatus::Active => "active",
        DealStatus::Closed => "closed",
    }
}

fn parse_deal_status(value: &str) -> Result<DealStatus, DealflowError> {
    match value {
        "active" => Ok(DealStatus::Active),
        "closed" => Ok(DealStatus::Closed),
        other => Err(DealflowError::Storage(format!(
            "unknown deal status '{other}' in storage"
        ))),
    }
}

fn parse_journey(value: &str) -> Result<JourneyType, DealflowError> {
    match value {
        "sell_side" => Ok(JourneyType::SellSide),
        "buy_side" => Ok(JourneyType::BuySide),
        "capital_raise" => Ok(JourneyType::CapitalRaise),
        "post_acquisition" => Ok(JourneyType::PostAcquisition),
        other => Err(DealflowError::Storage(format!(
            "unknown journey '{other}' in storage"
        ))),
    }
}

fn parse_deliverable_status(value: &str) -> Result<DeliverableStatus, DealflowError> {
    match value {
        "queued" => Ok(DeliverableStatus::Queued),
        "generating" => Ok(DeliverableStatus::Generating),
        "complete" => Ok(DeliverableStatus::Complete),
        "failed" => Ok(DeliverableStatus::Failed),
        other => Err(DealflowError::Storage(format!(
            "unknown deliverable status '{other}' in storage"
        ))),
    }
}

fn parse_progress_status(value: &str) -> Result<GateProgressStatus, DealflowError> {
    match value {
        "pending" => Ok(GateProgressStatus::Pending),
        "active" => Ok(GateProgressStatus::Active),
        "completed" => Ok(GateProgressStatus::Completed),
        other => Err(DealflowError::Storage(format!(
            "unknown progress status '{other}' in storage"
        ))),
    }
}

fn decode<'r, T>(row: &'r sqlx::postgres::PgRow, column: &str) -> Result<T, DealflowError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| DealflowError::Storage(format!("decode {column} failed: {e}")))
}

fn decode_balance(row: &sqlx::postgres::PgRow) -> Result<u64, DealflowError> {
    let balance: i64 = decode(row, "balance_minor")?;
    balance
        .try_into()
        .map_err(|_| DealflowError::Storage("negative wallet balance in storage".to_string()))
}

fn deal_from_row(row: &sqlx::postgres::PgRow) -> Result<Deal, DealflowError> {
    let journey: String = decode(row, "journey")?;
    let status: String = decode(row, "status")?;
    let attributes: Value = decode(row, "attributes")?;
    let attributes: BTreeMap<String, Value> = serde_json::from_value(attributes)
        .map_err(|e| DealflowError::Serialization(e.to_string()))?;

    Ok(Deal {
        deal_id: decode(row, "deal_id")?,
        owner_id: decode(row, "owner_id")?,
        journey: parse_journey(&journey)?,
        current_gate: decode(row, "current_gate")?,
        status: parse_deal_status(&status)?,
        attributes,
        created_at: decode(row, "created_at")?,
        updated_at: decode(row, "updated_at")?,
    })
}

fn progress_from_row(row: &sqlx::postgres::PgRow) -> Result<GateProgress, DealflowError> {
    let status: String = decode(row, "status")?;
    Ok(GateProgress {
        deal_id: decode(row, "deal_id")?,
        gate_id: decode(row, "gate_id")?,
        status: parse_progress_status(&status)?,
        entered_at: decode(row, "entered_at")?,
        completed_at: decode(row, "completed_at")?,
    })
}

fn transaction_from_row(row: &sqlx::postgres::PgRow) -> Result<WalletTransaction, DealflowError> {
    let chain_index: i64 = decode(row, "chain_index")?;
    Ok(WalletTransaction {
        txn_id: decode(row, "txn_id")?,
        user_id: decode(row, "user_id")?,
        chain_index: chain_index
            .try_into()
            .map_err(|_| DealflowError::Storage("negative chain index in storage".to_string()))?,
        amount_minor: decode(row, "amount_minor")?,
        description: decode(row, "description")?,
        deal_id: decode(row, "deal_id")?,
        created_at: decode(row, "created_at")?,
        previous_hash: decode(row, "previous_hash")?,
        entry_hash: decode(row, "entry_hash")?,
    })
}

fn deliverable_from_row(row: &sqlx::postgres::PgRow) -> Result<Deliverable, DealflowError> {
    let status: String = decode(row, "status")?;
    let generation_ms: Option<i64> = decode(row, "generation_ms")?;
    Ok(Deliverable {
        deliverable_id: decode(row, "deliverable_id")?,
        deal_id: decode(row, "deal_id")?,
        user_id: decode(row, "user_id")?,
        slug: decode(row, "slug")?,
        status: parse_deliverable_status(&status)?,
        content: decode(row, "content")?,
        error_detail: decode(row, "error_detail")?,
        generation_ms: generation_ms.map(|ms| ms.max(0) as u64),
        requested_at: decode(row, "requested_at")?,
        completed_at: decode(row, "completed_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Deliverable;
    use crate::wallet::verify_user_chain;

    #[tokio::test]
    async fn credit_then_debit_round_trips_with_chained_log() {
        let store = DealStore::memory();
        assert_eq!(store.credit("user-1", 5_000, "top-up").await.unwrap(), 5_000);

        let outcome = store
            .debit("user-1", 1_500, "gate settlement", Some("deal-1"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DebitOutcome::Applied {
                new_balance_minor: 3_500
            }
        );
        assert_eq!(store.balance("user-1").await.unwrap(), 3_500);

        let txns = store.transactions("user-1").await.unwrap();
        assert_eq!(txns.len(), 2);
        assert_eq!(txns[0].amount_minor, 5_000);
        assert_eq!(txns[1].amount_minor, -1_500);
        assert_eq!(txns[1].deal_id.as_deref(), Some("deal-1"));
        assert!(verify_user_chain(&txns));
    }

    #[tokio::test]
    async fn debit_shortfall_writes_nothing() {
        let store = DealStore::memory();
        store.credit("user-1", 1_000, "top-up").await.unwrap();

        let outcome = store
            .debit("user-1", 1_500, "gate settlement", None)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DebitOutcome::InsufficientFunds {
                balance_minor: 1_000
            }
        );
        assert_eq!(store.balance("user-1").await.unwrap(), 1_000);
        assert_eq!(store.transactions("user-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_debits_never_both_succeed_past_balance() {
        let store = DealStore::memory();
        store.credit("user-1", 2_000, "top-up").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.debit("user-1", 1_500, "settlement", None).await
            }));
        }

        let mut applied = 0;
        for handle in handles {
            if let DebitOutcome::Applied { .. } = handle.await.unwrap().unwrap() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(store.balance("user-1").await.unwrap(), 500);
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_respects_terminal_states() {
        let store = DealStore::memory();
        let deliverable = Deliverable::queued("deal-1", "user-1", "capital_stack");
        let id = deliverable.deliverable_id.clone();
        store.insert_deliverable(&deliverable).await.unwrap();

        assert!(store.claim_deliverable(&id).await.unwrap());
        assert!(!store.claim_deliverable(&id).await.unwrap());

        store
            .fail_deliverable(&id, "generator exploded", 12)
            .await
            .unwrap();
        assert!(!store.claim_deliverable(&id).await.unwrap());

        assert!(store.requeue_failed(&id).await.unwrap());
        assert!(store.claim_deliverable(&id).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_claims_admit_exactly_one_winner() {
        let store = DealStore::memory();
        let deliverable = Deliverable::queued("deal-1", "user-1", "capital_stack");
        let id = deliverable.deliverable_id.clone();
        store.insert_deliverable(&deliverable).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(
                async move { store.claim_deliverable(&id).await },
            ));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn terminal_writes_require_a_claimed_record() {
        let store = DealStore::memory();
        let deliverable = Deliverable::queued("deal-1", "user-1", "capital_stack");
        let id = deliverable.deliverable_id.clone();
        store.insert_deliverable(&deliverable).await.unwrap();

        // Still queued: nothing has claimed it, so finishing is rejected.
        assert!(store
            .complete_deliverable(&id, serde_json::json!({}), 5)
            .await
            .is_err());

        assert!(store.claim_deliverable(&id).await.unwrap());
        store
            .fail_deliverable(&id, "generator exploded", 5)
            .await
            .unwrap();

        // An external reset back to queued invalidates the old claim.
        assert!(store.requeue_failed(&id).await.unwrap());
        assert!(store
            .fail_deliverable(&id, "stale executor", 5)
            .await
            .is_err());
        let record = store.deliverable(&id).await.unwrap();
        assert_eq!(record.status, DeliverableStatus::Queued);
    }

    #[tokio::test]
    async fn queued_listing_is_oldest_first_and_bounded() {
        let store = DealStore::memory();
        for n in 0..5 {
            let deliverable = Deliverable::queued("deal-1", "user-1", format!("doc-{n}"));
            store.insert_deliverable(&deliverable).await.unwrap();
        }

        let queued = store.queued_deliverables(3).await.unwrap();
        assert_eq!(queued.len(), 3);
        assert!(queued.windows(2).all(|w| w[0].requested_at <= w[1].requested_at));
    }
}
