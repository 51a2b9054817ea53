use crate::error::BankError;
use crate::ledger::{normalize_name, LoanBook, LoanRecord};
use crate::protocol::{ConfirmationAction, ConfirmationPrompt, Confirmer};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Ledger persistence backend configuration.
#[derive(Debug, Clone)]
pub enum LedgerStorageConfig {
    /// Keep all loan rows in process memory only.
    Memory,
    /// Persist rows in PostgreSQL and hydrate the book on startup.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl LedgerStorageConfig {
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

impl Default for LedgerStorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

#[derive(Debug, Clone)]
enum LoanStorageBackend {
    Memory,
    Postgres(PostgresLoanStore),
}

/// Outcome of a cancellation request.
///
/// `Declined` and `TimedOut` both mean "no mutation performed"; they differ
/// only for operators reading logs, never for the end user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled { removed: usize },
    NothingToCancel,
    Declined,
    TimedOut,
}

impl CancelOutcome {
    /// True when the request ran to completion: either the targeted records
    /// are gone or there were none to begin with.
    pub fn completed(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::NothingToCancel)
    }
}

/// Durable loan store: in-memory authoritative book, optionally mirrored to
/// PostgreSQL.
///
/// Invariant handling:
/// - Row ids are assigned against the in-memory book first.
/// - A row is persisted before it is committed in-memory, so the book never
///   runs ahead of disk.
/// - Deletes are computed as a whole set and applied in a single transaction.
#[derive(Debug)]
struct LoanStore {
    book: LoanBook,
    backend: LoanStorageBackend,
}

impl LoanStore {
    async fn bootstrap(config: LedgerStorageConfig) -> Result<Self, BankError> {
        match config {
            LedgerStorageConfig::Memory => Ok(Self {
                book: LoanBook::new(),
                backend: LoanStorageBackend::Memory,
            }),
            LedgerStorageConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let store = PostgresLoanStore::connect(&database_url, max_connections).await?;
                store.ensure_schema().await?;
                let rows = store.load_rows().await?;
                let book = LoanBook::from_rows(rows)?;
                Ok(Self {
                    book,
                    backend: LoanStorageBackend::Postgres(store),
                })
            }
        }
    }

    fn backend_label(&self) -> &'static str {
        match self.backend {
            LoanStorageBackend::Memory => "memory",
            LoanStorageBackend::Postgres(_) => "postgres",
        }
    }

    async fn insert(
        &mut self,
        name: &str,
        amount: f64,
        interest_rate_percent: f64,
    ) -> Result<LoanRecord, BankError> {
        let row = self.book.build_row(name, amount, interest_rate_percent);
        if let LoanStorageBackend::Postgres(store) = &self.backend {
            store.insert_row(&row).await?;
        }
        self.book.commit_row(row.clone())?;
        Ok(row)
    }

    async fn remove_rows(&mut self, ids: &[i64]) -> Result<usize, BankError> {
        if let LoanStorageBackend::Postgres(store) = &self.backend {
            store.delete_rows(ids).await?;
        }
        Ok(self.book.remove_ids(ids))
    }

    async fn update_row(&mut self, row: LoanRecord) -> Result<(), BankError> {
        if let LoanStorageBackend::Postgres(store) = &self.backend {
            store.update_row(&row).await?;
        }
        self.book.replace(row)
    }
}

/// Transactional facade over the loan store.
///
/// Conflicting writes serialize per entity name: the per-name guard is held
/// across the confirmation wait of a gated cancellation, so a second
/// cancellation for the same name parks until the first commits and then
/// finds nothing left to cancel.
pub struct LoanLedger {
    store: Mutex<LoanStore>,
    name_guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    confirmation_timeout: Duration,
}

impl LoanLedger {
    pub async fn bootstrap(
        config: LedgerStorageConfig,
        confirmation_timeout: Duration,
    ) -> Result<Self, BankError> {
        let store = LoanStore::bootstrap(config).await?;
        info!(backend = store.backend_label(), "loan ledger ready");
        Ok(Self {
            store: Mutex::new(store),
            name_guards: Mutex::new(HashMap::new()),
            confirmation_timeout,
        })
    }

    /// Memory-backed ledger with a generous confirmation window; test and
    /// local-run convenience.
    pub async fn in_memory() -> Self {
        Self {
            store: Mutex::new(LoanStore {
                book: LoanBook::new(),
                backend: LoanStorageBackend::Memory,
            }),
            name_guards: Mutex::new(HashMap::new()),
            confirmation_timeout: Duration::from_secs(60),
        }
    }

    pub async fn backend_label(&self) -> &'static str {
        self.store.lock().await.backend_label()
    }

    /// Insert a new open loan and return the assigned record.
    pub async fn create(
        &self,
        name: &str,
        amount: f64,
        interest_rate_percent: f64,
    ) -> Result<LoanRecord, BankError> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(BankError::Validation(format!(
                "loan amount must be a positive number of dragons, got {amount}"
            )));
        }
        if !interest_rate_percent.is_finite() || interest_rate_percent < 0.0 {
            return Err(BankError::Validation(format!(
                "interest rate must be non-negative, got {interest_rate_percent}"
            )));
        }

        let guard = self.name_guard(name).await;
        let _held = guard.lock().await;

        let mut store = self.store.lock().await;
        let record = store.insert(name, amount, interest_rate_percent).await?;
        info!(id = record.id, name = %record.name, amount, rate = interest_rate_percent, "loan created");
        Ok(record)
    }

    /// Case-insensitive read, ascending id order.
    pub async fn get_by_name(&self, name: &str) -> Result<Vec<LoanRecord>, BankError> {
        Ok(self.store.lock().await.book.by_name(name))
    }

    pub async fn get_all(&self) -> Result<Vec<LoanRecord>, BankError> {
        Ok(self.store.lock().await.book.rows().to_vec())
    }

    /// Delete every open record for `name` immediately. Absence of records
    /// is a no-op success, not an error.
    pub async fn cancel_without_confirmation(
        &self,
        name: &str,
    ) -> Result<CancelOutcome, BankError> {
        let guard = self.name_guard(name).await;
        let _held = guard.lock().await;

        let ids = self.store.lock().await.book.open_ids(name);
        if ids.is_empty() {
            debug!(name = %normalize_name(name), "nothing to cancel");
            return Ok(CancelOutcome::NothingToCancel);
        }

        let removed = self.store.lock().await.remove_rows(&ids).await?;
        info!(name = %normalize_name(name), removed, "open loans cancelled without confirmation");
        Ok(CancelOutcome::Cancelled { removed })
    }

    /// Delete every open record for `name`, but only after the confirmer
    /// answers `accept`.
    ///
    /// No prompt is issued when there is nothing to cancel. The delete set is
    /// computed once, before the suspension, and applied as one transaction
    /// afterwards; decline, error, and timeout all leave the ledger
    /// untouched.
    pub async fn cancel_with_confirmation(
        &self,
        name: &str,
        confirmer: &dyn Confirmer,
    ) -> Result<CancelOutcome, BankError> {
        let guard = self.name_guard(name).await;
        let _held = guard.lock().await;

        let ids = self.store.lock().await.book.open_ids(name);
        if ids.is_empty() {
            debug!(name = %normalize_name(name), "nothing to cancel; skipping confirmation");
            return Ok(CancelOutcome::NothingToCancel);
        }

        let prompt = ConfirmationPrompt::cancel_loans(&normalize_name(name), ids.len());
        let action =
            match tokio::time::timeout(self.confirmation_timeout, confirmer.confirm(prompt)).await
            {
                Ok(Ok(action)) => action,
                Ok(Err(err)) => {
                    warn!(name = %normalize_name(name), error = %err, "confirmer failed; treating as decline");
                    ConfirmationAction::Error
                }
                Err(_elapsed) => {
                    warn!(name = %normalize_name(name), "confirmation timed out; ledger untouched");
                    return Ok(CancelOutcome::TimedOut);
                }
            };

        match action {
            ConfirmationAction::Accept => {
                let removed = self.store.lock().await.remove_rows(&ids).await?;
                info!(name = %normalize_name(name), removed, "cancellation confirmed and applied");
                Ok(CancelOutcome::Cancelled { removed })
            }
            ConfirmationAction::Decline => {
                info!(name = %normalize_name(name), "cancellation declined; ledger untouched");
                Ok(CancelOutcome::Declined)
            }
            ConfirmationAction::Error => {
                warn!(name = %normalize_name(name), "confirmation errored; ledger untouched");
                Ok(CancelOutcome::Declined)
            }
        }
    }

    /// Apply a repayment to the given loan; the loan closes once repayments
    /// cover the principal.
    pub async fn record_repayment(&self, id: i64, amount: f64) -> Result<LoanRecord, BankError> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(BankError::Validation(format!(
                "repayment must be a positive number of dragons, got {amount}"
            )));
        }

        // Resolve the row's name first so the write serializes with any
        // cancellation in flight for the same entity.
        let name = self
            .store
            .lock()
            .await
            .book
            .find(id)
            .map(|row| row.name.clone())
            .ok_or_else(|| BankError::Validation(format!("no loan with id {id}")))?;

        let guard = self.name_guard(&name).await;
        let _held = guard.lock().await;

        let mut store = self.store.lock().await;
        let mut row = store
            .book
            .find(id)
            .cloned()
            .ok_or_else(|| BankError::Validation(format!("no loan with id {id}")))?;

        row.repaid_amount += amount;
        if row.repaid_amount >= row.amount {
            row.loan_open = false;
        }

        store.update_row(row.clone()).await?;
        info!(id, repaid = row.repaid_amount, open = row.loan_open, "repayment recorded");
        Ok(row)
    }

    async fn name_guard(&self, name: &str) -> Arc<Mutex<()>> {
        let mut guards = self.name_guards.lock().await;
        guards
            .entry(normalize_name(name))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[derive(Debug, Clone)]
struct PostgresLoanStore {
    pool: PgPool,
}

impl PostgresLoanStore {
    async fn connect(database_url: &str, max_connections: u32) -> Result<Self, BankError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| BankError::Storage(format!("postgres connect failed: {e}")))?;

        Ok(Self { pool })
    }

    async fn ensure_schema(&self) -> Result<(), BankError> {
        // Ids are assigned by the application against the in-memory book, so
        // the column is a plain BIGINT primary key rather than a sequence.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mbank_loans (
                id BIGINT PRIMARY KEY,
                name TEXT NOT NULL,
                amount DOUBLE PRECISION NOT NULL,
                interest_rate_percent DOUBLE PRECISION NOT NULL,
                repaid_amount DOUBLE PRECISION NOT NULL DEFAULT 0,
                loan_open BOOLEAN NOT NULL DEFAULT TRUE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| BankError::Storage(format!("postgres schema create failed: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_mbank_loans_name ON mbank_loans (name)")
            .execute(&self.pool)
            .await
            .map_err(|e| BankError::Storage(format!("postgres index create failed: {e}")))?;

        Ok(())
    }

    async fn load_rows(&self) -> Result<Vec<LoanRecord>, BankError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, amount, interest_rate_percent, repaid_amount, loan_open
            FROM mbank_loans
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BankError::Storage(format!("postgres load failed: {e}")))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(LoanRecord {
                id: row
                    .try_get("id")
                    .map_err(|e| BankError::Storage(format!("postgres decode id failed: {e}")))?,
                name: row
                    .try_get("name")
                    .map_err(|e| BankError::Storage(format!("postgres decode name failed: {e}")))?,
                amount: row.try_get("amount").map_err(|e| {
                    BankError::Storage(format!("postgres decode amount failed: {e}"))
                })?,
                interest_rate_percent: row.try_get("interest_rate_percent").map_err(|e| {
                    BankError::Storage(format!("postgres decode interest_rate_percent failed: {e}"))
                })?,
                repaid_amount: row.try_get("repaid_amount").map_err(|e| {
                    BankError::Storage(format!("postgres decode repaid_amount failed: {e}"))
                })?,
                loan_open: row.try_get("loan_open").map_err(|e| {
                    BankError::Storage(format!("postgres decode loan_open failed: {e}"))
                })?,
            });
        }

        Ok(records)
    }

    async fn insert_row(&self, row: &LoanRecord) -> Result<(), BankError> {
        sqlx::query(
            r#"
            INSERT INTO mbank_loans (id, name, amount, interest_rate_percent, repaid_amount, loan_open)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(row.id)
        .bind(&row.name)
        .bind(row.amount)
        .bind(row.interest_rate_percent)
        .bind(row.repaid_amount)
        .bind(row.loan_open)
        .execute(&self.pool)
        .await
        .map_err(|e| BankError::Storage(format!("postgres insert failed: {e}")))?;

        Ok(())
    }

    /// Delete the whole id set in one transaction; all or nothing.
    async fn delete_rows(&self, ids: &[i64]) -> Result<u64, BankError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BankError::Storage(format!("postgres begin failed: {e}")))?;

        let result = sqlx::query("DELETE FROM mbank_loans WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .execute(&mut *tx)
            .await
            .map_err(|e| BankError::Storage(format!("postgres delete failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| BankError::Storage(format!("postgres commit failed: {e}")))?;

        Ok(result.rows_affected())
    }

    async fn update_row(&self, row: &LoanRecord) -> Result<(), BankError> {
        sqlx::query(
            r#"
            UPDATE mbank_loans
            SET repaid_amount = $2, loan_open = $3
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .bind(row.repaid_amount)
        .bind(row.loan_open)
        .execute(&self.pool)
        .await
        .map_err(|e| BankError::Storage(format!("postgres update failed: {e}")))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Answers every prompt with a fixed action.
    struct FixedConfirmer(ConfirmationAction);

    #[async_trait]
    impl Confirmer for FixedConfirmer {
        async fn confirm(
            &self,
            _prompt: ConfirmationPrompt,
        ) -> Result<ConfirmationAction, BankError> {
            Ok(self.0)
        }
    }

    /// Fails the test if the ledger issues a prompt at all.
    struct MustNotPrompt;

    #[async_trait]
    impl Confirmer for MustNotPrompt {
        async fn confirm(
            &self,
            prompt: ConfirmationPrompt,
        ) -> Result<ConfirmationAction, BankError> {
            panic!("unexpected confirmation prompt: {}", prompt.message);
        }
    }

    /// Never answers; exercises the timeout path.
    struct SilentConfirmer;

    #[async_trait]
    impl Confirmer for SilentConfirmer {
        async fn confirm(
            &self,
            _prompt: ConfirmationPrompt,
        ) -> Result<ConfirmationAction, BankError> {
            std::future::pending().await
        }
    }

    async fn seeded_ledger() -> LoanLedger {
        let ledger = LoanLedger::in_memory().await;
        ledger.create("Stark", 1000.0, 28.0).await.unwrap();
        ledger.create("stark", 500.0, 33.0).await.unwrap();
        ledger.create("Lannister", 2000.0, 15.0).await.unwrap();
        ledger
    }

    #[tokio::test]
    async fn created_rate_is_fixed_and_readable_by_name() {
        let ledger = LoanLedger::in_memory().await;
        let record = ledger.create("Stark", 1000.0, 28.4).await.unwrap();

        // A later pricing run with different inputs must not touch the row.
        let _ = crate::pricing::interest_rate(1.0, 0.0, 5, 0);

        let records = ledger.get_by_name("STARK").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, record.id);
        assert_eq!(records[0].interest_rate_percent, 28.4);
    }

    #[tokio::test]
    async fn create_rejects_nonpositive_amounts() {
        let ledger = LoanLedger::in_memory().await;
        assert!(matches!(
            ledger.create("stark", 0.0, 10.0).await,
            Err(BankError::Validation(_))
        ));
        assert!(matches!(
            ledger.create("stark", 100.0, -1.0).await,
            Err(BankError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn immediate_cancel_on_absent_name_is_a_noop_success() {
        let ledger = LoanLedger::in_memory().await;
        let outcome = ledger.cancel_without_confirmation("ghost").await.unwrap();
        assert_eq!(outcome, CancelOutcome::NothingToCancel);
        assert!(outcome.completed());
    }

    #[tokio::test]
    async fn declined_confirmation_leaves_ledger_unchanged() {
        let ledger = seeded_ledger().await;
        let before = ledger.get_by_name("stark").await.unwrap();

        let outcome = ledger
            .cancel_with_confirmation("stark", &FixedConfirmer(ConfirmationAction::Decline))
            .await
            .unwrap();

        assert_eq!(outcome, CancelOutcome::Declined);
        assert!(!outcome.completed());
        assert_eq!(ledger.get_by_name("stark").await.unwrap(), before);
    }

    #[tokio::test]
    async fn accepted_confirmation_removes_exactly_the_open_records() {
        let ledger = seeded_ledger().await;
        // Close the second stark loan by repaying it in full.
        ledger.record_repayment(2, 500.0).await.unwrap();

        let outcome = ledger
            .cancel_with_confirmation("stark", &FixedConfirmer(ConfirmationAction::Accept))
            .await
            .unwrap();

        assert_eq!(outcome, CancelOutcome::Cancelled { removed: 1 });
        let remaining = ledger.get_by_name("stark").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].is_closed());
        // Unrelated entities are untouched.
        assert_eq!(ledger.get_by_name("lannister").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zero_open_records_short_circuits_without_prompting() {
        let ledger = LoanLedger::in_memory().await;
        let outcome = ledger
            .cancel_with_confirmation("ghost", &MustNotPrompt)
            .await
            .unwrap();
        assert_eq!(outcome, CancelOutcome::NothingToCancel);
    }

    #[tokio::test]
    async fn confirmation_timeout_resolves_to_no_mutation() {
        let ledger = LoanLedger::bootstrap(
            LedgerStorageConfig::memory(),
            Duration::from_millis(25),
        )
        .await
        .unwrap();
        ledger.create("stark", 1000.0, 28.0).await.unwrap();

        let outcome = ledger
            .cancel_with_confirmation("stark", &SilentConfirmer)
            .await
            .unwrap();

        assert_eq!(outcome, CancelOutcome::TimedOut);
        assert_eq!(ledger.get_by_name("stark").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn confirmer_transport_error_counts_as_decline() {
        let ledger = seeded_ledger().await;

        struct FailingConfirmer;
        #[async_trait]
        impl Confirmer for FailingConfirmer {
            async fn confirm(
                &self,
                _prompt: ConfirmationPrompt,
            ) -> Result<ConfirmationAction, BankError> {
                Err(BankError::remote("elicitation", "socket closed"))
            }
        }

        let outcome = ledger
            .cancel_with_confirmation("stark", &FailingConfirmer)
            .await
            .unwrap();
        assert_eq!(outcome, CancelOutcome::Declined);
        assert_eq!(ledger.get_by_name("stark").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_cancellations_never_double_delete() {
        let ledger = Arc::new(seeded_ledger().await);

        let first = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .cancel_with_confirmation("stark", &FixedConfirmer(ConfirmationAction::Accept))
                    .await
                    .unwrap()
            })
        };
        let second = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .cancel_with_confirmation("stark", &FixedConfirmer(ConfirmationAction::Accept))
                    .await
                    .unwrap()
            })
        };

        let outcomes = [first.await.unwrap(), second.await.unwrap()];
        let removed: usize = outcomes
            .iter()
            .map(|outcome| match outcome {
                CancelOutcome::Cancelled { removed } => *removed,
                _ => 0,
            })
            .sum();

        // One request deletes both open loans; the other finds nothing left.
        assert_eq!(removed, 2);
        assert!(outcomes.contains(&CancelOutcome::NothingToCancel));
        assert!(ledger.get_by_name("stark").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repayment_closes_the_loan_at_full_principal() {
        let ledger = LoanLedger::in_memory().await;
        let record = ledger.create("braavos", 300.0, 12.0).await.unwrap();

        let partial = ledger.record_repayment(record.id, 100.0).await.unwrap();
        assert!(partial.loan_open);
        assert_eq!(partial.repaid_amount, 100.0);

        let settled = ledger.record_repayment(record.id, 200.0).await.unwrap();
        assert!(settled.is_closed());
    }
}
