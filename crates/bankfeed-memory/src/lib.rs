//! In-memory `LedgerStore` backend for tests, benches and ephemeral runs.

use std::collections::BTreeMap;
use std::sync::RwLock;

use time::OffsetDateTime;

use bankfeed_core::{Account, LedgerStore, StorageError, Transaction};

#[derive(Default)]
struct Inner {
    accounts: BTreeMap<String, Account>,
    /// account id -> external id -> row
    transactions: BTreeMap<String, BTreeMap<String, Transaction>>,
    cursors: BTreeMap<String, OffsetDateTime>,
}

#[derive(Default)]
pub struct MemoryLedger {
    inner: RwLock<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryLedger {
    fn upsert_accounts(&self, accounts: &[Account]) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        for account in accounts {
            inner.accounts.insert(account.id.clone(), account.clone());
        }
        tracing::debug!(count = accounts.len(), "accounts upserted");
        Ok(())
    }

    fn upsert_transactions(
        &self,
        account_id: &str,
        transactions: &[Transaction],
    ) -> Result<(), StorageError> {
        // Validate the whole batch before touching state so a bad row cannot
        // leave a half-applied merge behind.
        if let Some(stray) = transactions.iter().find(|t| t.account_id != account_id) {
            return Err(StorageError::Backend(format!(
                "transaction {} belongs to account {}, not {}",
                stray.id, stray.account_id, account_id
            )));
        }

        let mut inner = self.inner.write().unwrap();
        let rows = inner.transactions.entry(account_id.to_string()).or_default();
        for txn in transactions {
            rows.insert(txn.id.clone(), txn.clone());
        }
        tracing::debug!(account = account_id, count = transactions.len(), "transactions upserted");
        Ok(())
    }

    fn all_accounts(&self) -> Result<Vec<Account>, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(inner.accounts.values().cloned().collect())
    }

    fn transactions_in_range(
        &self,
        account_id: &str,
        from: OffsetDateTime,
        until: OffsetDateTime,
    ) -> Result<Vec<Transaction>, StorageError> {
        let inner = self.inner.read().unwrap();
        let mut result: Vec<Transaction> = match inner.transactions.get(account_id) {
            Some(rows) => rows
                .values()
                .filter(|t| t.posted_at >= from && t.posted_at <= until)
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        result.sort_by(|a, b| b.posted_at.cmp(&a.posted_at).then(b.id.cmp(&a.id)));
        Ok(result)
    }

    fn get_cursor(&self, account_id: &str) -> Result<Option<OffsetDateTime>, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(inner.cursors.get(account_id).copied())
    }

    fn advance_cursor(&self, account_id: &str, ts: OffsetDateTime) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        let cursor = inner.cursors.entry(account_id.to_string()).or_insert(ts);
        // A cursor never moves backwards; an older timestamp is a no-op.
        if ts > *cursor {
            *cursor = ts;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::macros::datetime;

    fn account(id: &str) -> Account {
        Account {
            id: id.to_string(),
            name: "Checking".to_string(),
            org_name: "Demo Bank".to_string(),
            currency: "USD".to_string(),
            balance: dec!(100.00),
            balance_as_of: datetime!(2024-01-15 00:00 UTC),
        }
    }

    fn txn(account_id: &str, id: &str, posted_at: OffsetDateTime) -> Transaction {
        Transaction {
            id: id.to_string(),
            account_id: account_id.to_string(),
            posted_at,
            amount: dec!(-12.34),
            description: "coffee".to_string(),
            payee: Some("Cafe".to_string()),
            pending: false,
        }
    }

    #[test]
    fn upsert_transactions_deduplicates_by_key() {
        let store = MemoryLedger::new();
        let t = txn("acc1", "t1", datetime!(2024-01-10 09:00 UTC));
        store.upsert_transactions("acc1", &[t.clone()]).unwrap();
        store.upsert_transactions("acc1", &[t]).unwrap();

        let rows = store
            .transactions_in_range(
                "acc1",
                datetime!(2024-01-01 00:00 UTC),
                datetime!(2024-02-01 00:00 UTC),
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn refetch_updates_row_in_place() {
        let store = MemoryLedger::new();
        let mut t = txn("acc1", "t1", datetime!(2024-01-10 09:00 UTC));
        t.pending = true;
        store.upsert_transactions("acc1", &[t.clone()]).unwrap();

        t.pending = false;
        t.amount = dec!(-15.00);
        store.upsert_transactions("acc1", &[t]).unwrap();

        let rows = store
            .transactions_in_range(
                "acc1",
                datetime!(2024-01-01 00:00 UTC),
                datetime!(2024-02-01 00:00 UTC),
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].pending);
        assert_eq!(rows[0].amount, dec!(-15.00));
    }

    #[test]
    fn range_query_is_bounded_and_newest_first() {
        let store = MemoryLedger::new();
        store
            .upsert_transactions(
                "acc1",
                &[
                    txn("acc1", "old", datetime!(2023-12-01 00:00 UTC)),
                    txn("acc1", "mid", datetime!(2024-01-05 00:00 UTC)),
                    txn("acc1", "new", datetime!(2024-01-12 00:00 UTC)),
                ],
            )
            .unwrap();

        let rows = store
            .transactions_in_range(
                "acc1",
                datetime!(2024-01-01 00:00 UTC),
                datetime!(2024-02-01 00:00 UTC),
            )
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid"]);
    }

    #[test]
    fn mismatched_batch_leaves_store_untouched() {
        let store = MemoryLedger::new();
        let good = txn("acc1", "t1", datetime!(2024-01-10 09:00 UTC));
        let stray = txn("acc2", "t2", datetime!(2024-01-11 09:00 UTC));

        let err = store.upsert_transactions("acc1", &[good, stray]).unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));

        let rows = store
            .transactions_in_range(
                "acc1",
                datetime!(2024-01-01 00:00 UTC),
                datetime!(2024-02-01 00:00 UTC),
            )
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn cursor_only_advances() {
        let store = MemoryLedger::new();
        assert!(store.get_cursor("acc1").unwrap().is_none());

        store
            .advance_cursor("acc1", datetime!(2024-01-10 00:00 UTC))
            .unwrap();
        store
            .advance_cursor("acc1", datetime!(2024-01-05 00:00 UTC))
            .unwrap();

        assert_eq!(
            store.get_cursor("acc1").unwrap(),
            Some(datetime!(2024-01-10 00:00 UTC))
        );
    }

    #[test]
    fn accounts_are_replaced_not_duplicated() {
        let store = MemoryLedger::new();
        store.upsert_accounts(&[account("acc1")]).unwrap();

        let mut updated = account("acc1");
        updated.balance = dec!(250.00);
        store.upsert_accounts(&[updated]).unwrap();

        let accounts = store.all_accounts().unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].balance, dec!(250.00));
    }
}
