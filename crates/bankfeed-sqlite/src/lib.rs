//! SQLite `LedgerStore` backend.
//!
//! Amounts are stored as decimal strings, timestamps as unix seconds. Batch
//! upserts run inside a single SQLite transaction so a failure partway
//! rolls the whole batch back.

use std::str::FromStr;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use time::OffsetDateTime;

use bankfeed_core::{Account, LedgerStore, StorageError, Transaction};

pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                org_name TEXT NOT NULL,
                currency TEXT NOT NULL,
                balance TEXT NOT NULL,
                balance_as_of INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transactions (
                account_id TEXT NOT NULL,
                external_id TEXT NOT NULL,
                posted_at INTEGER NOT NULL,
                amount TEXT NOT NULL,
                description TEXT NOT NULL,
                payee TEXT,
                pending INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (account_id, external_id),
                FOREIGN KEY (account_id) REFERENCES accounts(id)
            );

            CREATE INDEX IF NOT EXISTS idx_txn_account_posted
                ON transactions(account_id, posted_at);

            CREATE TABLE IF NOT EXISTS sync_cursors (
                account_id TEXT PRIMARY KEY,
                fetched_through INTEGER NOT NULL
            );
            ",
        )
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}

fn decimal_from_text(text: &str) -> Result<Decimal, StorageError> {
    Decimal::from_str(text).map_err(|e| StorageError::Backend(format!("bad decimal {text}: {e}")))
}

fn timestamp_from_unix(ts: i64) -> Result<OffsetDateTime, StorageError> {
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|e| StorageError::Backend(format!("bad timestamp {ts}: {e}")))
}

impl LedgerStore for SqliteLedger {
    fn upsert_accounts(&self, accounts: &[Account]) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        for account in accounts {
            tx.execute(
                "INSERT INTO accounts (id, name, org_name, currency, balance, balance_as_of)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    org_name = excluded.org_name,
                    currency = excluded.currency,
                    balance = excluded.balance,
                    balance_as_of = excluded.balance_as_of",
                params![
                    account.id,
                    account.name,
                    account.org_name,
                    account.currency,
                    account.balance.to_string(),
                    account.balance_as_of.unix_timestamp(),
                ],
            )
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        tx.commit().map_err(|e| StorageError::Backend(e.to_string()))?;
        tracing::debug!(count = accounts.len(), "accounts upserted");
        Ok(())
    }

    fn upsert_transactions(
        &self,
        account_id: &str,
        transactions: &[Transaction],
    ) -> Result<(), StorageError> {
        if let Some(stray) = transactions.iter().find(|t| t.account_id != account_id) {
            return Err(StorageError::Backend(format!(
                "transaction {} belongs to account {}, not {}",
                stray.id, stray.account_id, account_id
            )));
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        for txn in transactions {
            tx.execute(
                "INSERT INTO transactions
                    (account_id, external_id, posted_at, amount, description, payee, pending)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(account_id, external_id) DO UPDATE SET
                    posted_at = excluded.posted_at,
                    amount = excluded.amount,
                    description = excluded.description,
                    payee = excluded.payee,
                    pending = excluded.pending",
                params![
                    txn.account_id,
                    txn.id,
                    txn.posted_at.unix_timestamp(),
                    txn.amount.to_string(),
                    txn.description,
                    txn.payee,
                    txn.pending as i64,
                ],
            )
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        tx.commit().map_err(|e| StorageError::Backend(e.to_string()))?;
        tracing::debug!(account = account_id, count = transactions.len(), "transactions upserted");
        Ok(())
    }

    fn all_accounts(&self) -> Result<Vec<Account>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, org_name, currency, balance, balance_as_of
                 FROM accounts ORDER BY org_name, name",
            )
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter()
            .map(|(id, name, org_name, currency, balance, as_of)| {
                Ok(Account {
                    id,
                    name,
                    org_name,
                    currency,
                    balance: decimal_from_text(&balance)?,
                    balance_as_of: timestamp_from_unix(as_of)?,
                })
            })
            .collect()
    }

    fn transactions_in_range(
        &self,
        account_id: &str,
        from: OffsetDateTime,
        until: OffsetDateTime,
    ) -> Result<Vec<Transaction>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT external_id, account_id, posted_at, amount, description, payee, pending
                 FROM transactions
                 WHERE account_id = ?1 AND posted_at >= ?2 AND posted_at <= ?3
                 ORDER BY posted_at DESC, external_id DESC",
            )
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows = stmt
            .query_map(
                params![account_id, from.unix_timestamp(), until.unix_timestamp()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter()
            .map(|(id, account_id, posted_at, amount, description, payee, pending)| {
                Ok(Transaction {
                    id,
                    account_id,
                    posted_at: timestamp_from_unix(posted_at)?,
                    amount: decimal_from_text(&amount)?,
                    description,
                    payee,
                    pending: pending != 0,
                })
            })
            .collect()
    }

    fn get_cursor(&self, account_id: &str) -> Result<Option<OffsetDateTime>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT fetched_through FROM sync_cursors WHERE account_id = ?1")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let ts: Option<i64> = match stmt.query_row(params![account_id], |row| row.get(0)) {
            Ok(value) => Some(value),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(StorageError::Backend(e.to_string())),
        };
        ts.map(timestamp_from_unix).transpose()
    }

    fn advance_cursor(&self, account_id: &str, ts: OffsetDateTime) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        // max() keeps the cursor monotonic; an older timestamp is a no-op.
        conn.execute(
            "INSERT INTO sync_cursors (account_id, fetched_through)
             VALUES (?1, ?2)
             ON CONFLICT(account_id) DO UPDATE SET
                fetched_through = max(fetched_through, excluded.fetched_through)",
            params![account_id, ts.unix_timestamp()],
        )
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        tracing::debug!(account = account_id, through = ts.unix_timestamp(), "cursor advanced");
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
            balance: dec!(1200.50),
            balance_as_of: datetime!(2024-01-15 00:00 UTC),
        }
    }

    fn txn(account_id: &str, id: &str, posted_at: OffsetDateTime, pending: bool) -> Transaction {
        Transaction {
            id: id.to_string(),
            account_id: account_id.to_string(),
            posted_at,
            amount: dec!(-42.10),
            description: "groceries".to_string(),
            payee: Some("Market".to_string()),
            pending,
        }
    }

    fn seeded_store() -> SqliteLedger {
        let store = SqliteLedger::new(":memory:").unwrap();
        store.upsert_accounts(&[account("acc1")]).unwrap();
        store
    }

    #[test]
    fn overlapping_fetches_do_not_duplicate() {
        let store = seeded_store();
        let rows = vec![
            txn("acc1", "t1", datetime!(2024-01-10 09:00 UTC), false),
            txn("acc1", "t2", datetime!(2024-01-11 09:00 UTC), false),
        ];
        store.upsert_transactions("acc1", &rows).unwrap();
        // Second fetch overlaps the first window entirely.
        store.upsert_transactions("acc1", &rows).unwrap();

        let stored = store
            .transactions_in_range(
                "acc1",
                datetime!(2024-01-01 00:00 UTC),
                datetime!(2024-02-01 00:00 UTC),
            )
            .unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[test]
    fn pending_settles_to_posted_in_place() {
        let store = seeded_store();
        store
            .upsert_transactions(
                "acc1",
                &[txn("acc1", "t1", datetime!(2024-01-10 09:00 UTC), true)],
            )
            .unwrap();
        store
            .upsert_transactions(
                "acc1",
                &[txn("acc1", "t1", datetime!(2024-01-10 12:00 UTC), false)],
            )
            .unwrap();

        let stored = store
            .transactions_in_range(
                "acc1",
                datetime!(2024-01-01 00:00 UTC),
                datetime!(2024-02-01 00:00 UTC),
            )
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].pending);
        assert_eq!(stored[0].posted_at, datetime!(2024-01-10 12:00 UTC));
    }

    #[test]
    fn range_query_newest_first_with_bounds() {
        let store = seeded_store();
        store
            .upsert_transactions(
                "acc1",
                &[
                    txn("acc1", "outside", datetime!(2023-11-01 00:00 UTC), false),
                    txn("acc1", "a", datetime!(2024-01-05 00:00 UTC), false),
                    txn("acc1", "b", datetime!(2024-01-12 00:00 UTC), false),
                ],
            )
            .unwrap();

        let stored = store
            .transactions_in_range(
                "acc1",
                datetime!(2024-01-01 00:00 UTC),
                datetime!(2024-02-01 00:00 UTC),
            )
            .unwrap();
        let ids: Vec<&str> = stored.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn decimal_survives_round_trip_exactly() {
        let store = seeded_store();
        let mut t = txn("acc1", "t1", datetime!(2024-01-10 09:00 UTC), false);
        t.amount = dec!(-0.10);
        store.upsert_transactions("acc1", &[t]).unwrap();

        let stored = store
            .transactions_in_range(
                "acc1",
                datetime!(2024-01-01 00:00 UTC),
                datetime!(2024-02-01 00:00 UTC),
            )
            .unwrap();
        assert_eq!(stored[0].amount, dec!(-0.10));
        assert_eq!(stored[0].amount.to_string(), "-0.10");
    }

    #[test]
    fn cursor_round_trip_and_monotonicity() {
        let store = seeded_store();
        assert!(store.get_cursor("acc1").unwrap().is_none());

        store
            .advance_cursor("acc1", datetime!(2024-01-10 00:00 UTC))
            .unwrap();
        store
            .advance_cursor("acc1", datetime!(2024-01-02 00:00 UTC))
            .unwrap();

        assert_eq!(
            store.get_cursor("acc1").unwrap(),
            Some(datetime!(2024-01-10 00:00 UTC))
        );
    }

    #[test]
    fn account_update_replaces_row() {
        let store = seeded_store();
        let mut updated = account("acc1");
        updated.balance = dec!(900.00);
        updated.balance_as_of = datetime!(2024-01-20 00:00 UTC);
        store.upsert_accounts(&[updated]).unwrap();

        let accounts = store.all_accounts().unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].balance, dec!(900.00));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let path = path.to_str().unwrap();

        {
            let store = SqliteLedger::new(path).unwrap();
            store.upsert_accounts(&[account("acc1")]).unwrap();
            store
                .upsert_transactions(
                    "acc1",
                    &[txn("acc1", "t1", datetime!(2024-01-10 09:00 UTC), false)],
                )
                .unwrap();
            store
                .advance_cursor("acc1", datetime!(2024-01-10 09:00 UTC))
                .unwrap();
        }

        let store = SqliteLedger::new(path).unwrap();
        assert_eq!(store.all_accounts().unwrap().len(), 1);
        assert_eq!(
            store.get_cursor("acc1").unwrap(),
            Some(datetime!(2024-01-10 09:00 UTC))
        );
    }
}
