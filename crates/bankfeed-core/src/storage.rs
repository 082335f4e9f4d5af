use time::OffsetDateTime;

use crate::error::StorageError;
use crate::models::{Account, Transaction};

/// Durable, queryable persistence for synced accounts and transactions, the
/// single source of truth both consumers read from.
///
/// Batch mutations are transactional: a failure partway through a call leaves
/// the store at its pre-call state. Queries read a snapshot consistent as of
/// call time; an in-progress upsert is never observable.
pub trait LedgerStore: Send + Sync {
    /// Insert or replace accounts by provider id. Sync never deletes an
    /// account the provider stopped returning; removal is an explicit
    /// consumer action.
    fn upsert_accounts(&self, accounts: &[Account]) -> Result<(), StorageError>;

    /// Insert or replace transactions by `(account_id, id)`. A row already
    /// present under that key is updated in place (pending entries settle to
    /// posted under the same id), never duplicated.
    fn upsert_transactions(
        &self,
        account_id: &str,
        transactions: &[Transaction],
    ) -> Result<(), StorageError>;

    fn all_accounts(&self) -> Result<Vec<Account>, StorageError>;

    /// Transactions for one account posted within `[from, until]`, newest
    /// first.
    fn transactions_in_range(
        &self,
        account_id: &str,
        from: OffsetDateTime,
        until: OffsetDateTime,
    ) -> Result<Vec<Transaction>, StorageError>;

    /// Watermark of the latest timestamp whose data is fully committed for
    /// this account, or `None` before the first committed fetch.
    fn get_cursor(&self, account_id: &str) -> Result<Option<OffsetDateTime>, StorageError>;

    /// Record that everything up to `ts` is durably committed. Callers must
    /// commit the matching upsert first; the cursor must never run ahead of
    /// persisted data.
    fn advance_cursor(&self, account_id: &str, ts: OffsetDateTime) -> Result<(), StorageError>;
}
