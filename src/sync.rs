//! Synchronization engine.
//!
//! A refresh cycle runs Fetching, Merging, then Committed or Failed. Views
//! are always answered from the ledger store after the attempt, never from
//! raw provider output, so a provider outage degrades to cached data
//! instead of an error. At most one cycle runs per process; a request that
//! finds one in flight is served the last committed snapshot immediately.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use bankfeed_core::{
    AccessCredential, Account, CredentialVault, Error, LedgerStore, Provider, ProviderError,
    Result, StorageError, TimeWindow, Transaction,
};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Floor between provider refreshes; views inside it are served straight
    /// from the store.
    pub min_refresh: StdDuration,
    /// Overall deadline for one cycle; accounts not finished by then are
    /// served stale.
    pub cycle_timeout: StdDuration,
    /// Lookback used when a consumer does not say how far back it wants.
    pub default_lookback_days: i64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            min_refresh: StdDuration::from_secs(300),
            cycle_timeout: StdDuration::from_secs(60),
            default_lookback_days: 30,
        }
    }
}

/// Freshness markers attached to every view.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    /// Whether this request reached the provider at all.
    pub refreshed: bool,
    /// Another request's cycle was in flight; data is the last committed
    /// snapshot.
    pub refresh_in_progress: bool,
    /// Accounts served from cache because their fetch failed or timed out.
    pub stale_accounts: Vec<String>,
    pub warnings: Vec<String>,
}

impl SyncStatus {
    pub fn is_stale(&self) -> bool {
        self.refresh_in_progress || !self.stale_accounts.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountsView {
    pub accounts: Vec<Account>,
    pub status: SyncStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionsView {
    pub transactions: Vec<Transaction>,
    pub status: SyncStatus,
}

struct CycleState {
    last_committed: Option<OffsetDateTime>,
}

pub struct SyncService {
    provider: Arc<dyn Provider>,
    store: Arc<dyn LedgerStore>,
    vault: Arc<dyn CredentialVault>,
    options: SyncOptions,
    cycle: Mutex<CycleState>,
}

impl SyncService {
    pub fn new(
        provider: Arc<dyn Provider>,
        store: Arc<dyn LedgerStore>,
        vault: Arc<dyn CredentialVault>,
        options: SyncOptions,
    ) -> Self {
        Self {
            provider,
            store,
            vault,
            options,
            cycle: Mutex::new(CycleState {
                last_committed: None,
            }),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Exchange a one-time setup token and rotate the stored credential.
    /// Re-running replaces the credential; it never merges.
    pub async fn setup(&self, token: &str) -> Result<()> {
        let credential = self.provider.exchange_setup_token(token).await?;
        self.vault.rotate(&credential)?;
        tracing::info!(provider = self.provider.name(), "credential stored");
        Ok(())
    }

    pub async fn get_accounts(&self, force: bool) -> Result<AccountsView> {
        let status = self
            .refresh(self.options.default_lookback_days, force)
            .await?;
        let accounts = self.store.all_accounts().map_err(Error::Storage)?;
        Ok(AccountsView { accounts, status })
    }

    pub async fn get_transactions(&self, days_back: i64, force: bool) -> Result<TransactionsView> {
        let days = if days_back > 0 {
            days_back
        } else {
            self.options.default_lookback_days
        };
        let status = self.refresh(days, force).await?;

        let range = TimeWindow::days_back(OffsetDateTime::now_utc(), days);
        let mut transactions = Vec::new();
        for account in self.store.all_accounts().map_err(Error::Storage)? {
            transactions.extend(
                self.store
                    .transactions_in_range(&account.id, range.since, range.until)
                    .map_err(Error::Storage)?,
            );
        }
        transactions.sort_by(|a, b| b.posted_at.cmp(&a.posted_at).then(b.id.cmp(&a.id)));
        Ok(TransactionsView {
            transactions,
            status,
        })
    }

    /// Run (or skip) one refresh cycle and report how fresh the store's view
    /// is. Actionable failures (no credential, locked vault, rejected
    /// credential) propagate; transient provider trouble degrades the view
    /// instead.
    async fn refresh(&self, lookback_days: i64, force: bool) -> Result<SyncStatus> {
        // Single logical sync owner: never start a second overlapping cycle
        // against the same credential.
        let mut cycle = match self.cycle.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                return Ok(SyncStatus {
                    refresh_in_progress: true,
                    ..SyncStatus::default()
                })
            }
        };

        let now = OffsetDateTime::now_utc();
        if !force {
            if let Some(last) = cycle.last_committed {
                if (now - last).whole_seconds() < self.options.min_refresh.as_secs() as i64 {
                    return Ok(SyncStatus::default());
                }
            }
        }

        let credential = self.vault.load().map_err(Error::Vault)?;

        let cycle_id = Uuid::new_v4();
        tracing::info!(%cycle_id, lookback_days, force, "sync cycle started");

        let status = self.run_cycle(&credential, lookback_days, now).await?;

        if status.refreshed {
            cycle.last_committed = Some(now);
        }
        tracing::info!(
            %cycle_id,
            refreshed = status.refreshed,
            stale = status.stale_accounts.len(),
            "sync cycle finished"
        );
        Ok(status)
    }

    async fn run_cycle(
        &self,
        credential: &AccessCredential,
        lookback_days: i64,
        now: OffsetDateTime,
    ) -> Result<SyncStatus> {
        let deadline = Instant::now() + self.options.cycle_timeout;
        let mut status = SyncStatus {
            refreshed: true,
            ..SyncStatus::default()
        };

        // Fetching: the full current account set first.
        let fetch = tokio::time::timeout_at(deadline, self.provider.list_accounts(credential));
        let accounts = match fetch.await {
            Ok(Ok(accounts)) => accounts,
            Ok(Err(err)) if degradable(&err) => {
                // The whole cycle degrades to cache; the view still succeeds.
                tracing::warn!(error = %err, "account listing failed; serving cached data");
                status.refreshed = false;
                status.warnings.push(err.to_string());
                status.stale_accounts = self
                    .store
                    .all_accounts()
                    .map_err(Error::Storage)?
                    .into_iter()
                    .map(|a| a.id)
                    .collect();
                return Ok(status);
            }
            Ok(Err(err)) => return Err(Error::Provider(err)),
            Err(_elapsed) => {
                tracing::warn!("account listing exceeded the cycle deadline; serving cached data");
                status.refreshed = false;
                status.warnings.push("provider did not answer in time".to_string());
                status.stale_accounts = self
                    .store
                    .all_accounts()
                    .map_err(Error::Storage)?
                    .into_iter()
                    .map(|a| a.id)
                    .collect();
                return Ok(status);
            }
        };

        self.store.upsert_accounts(&accounts).map_err(Error::Storage)?;

        // Merging, one account at a time. Accounts are independent units of
        // work: one failure never blocks the others, and each batch commits
        // before its cursor moves.
        for account in &accounts {
            let window = self.fetch_window_for(&account.id, lookback_days, now)?;
            if window.is_empty() {
                continue;
            }

            let fetch = tokio::time::timeout_at(
                deadline,
                self.provider.list_transactions(credential, &account.id, window),
            );
            match fetch.await {
                Ok(Ok(transactions)) => {
                    self.commit_account(&account.id, &transactions, window.until, &mut status);
                }
                Ok(Err(ProviderError::Partial { fetched, unfetched })) => {
                    // Commit what arrived. The cursor stops at the gap start
                    // so the next cycle retries only the gap.
                    tracing::warn!(account = %account.id, gap = %unfetched, "partial fetch committed");
                    self.commit_account(&account.id, &fetched, unfetched.since, &mut status);
                    mark_stale(&mut status, &account.id, "partial fetch, gap retried next cycle");
                }
                Ok(Err(err)) if degradable(&err) => {
                    tracing::warn!(account = %account.id, error = %err, "account fetch failed");
                    mark_stale(&mut status, &account.id, &err.to_string());
                }
                Ok(Err(err)) => return Err(Error::Provider(err)),
                Err(_elapsed) => {
                    tracing::warn!(account = %account.id, "account fetch exceeded the cycle deadline");
                    mark_stale(&mut status, &account.id, "fetch timed out");
                }
            }
        }

        Ok(status)
    }

    /// `[max(cursor, now - lookback), now]`: never less than the consumer
    /// asked for, never refetching what is already committed.
    fn fetch_window_for(
        &self,
        account_id: &str,
        lookback_days: i64,
        now: OffsetDateTime,
    ) -> Result<TimeWindow> {
        let floor = now - Duration::days(lookback_days);
        let since = match self.store.get_cursor(account_id).map_err(Error::Storage)? {
            Some(cursor) if cursor > floor => cursor,
            _ => floor,
        };
        Ok(TimeWindow::new(since, now))
    }

    /// All-or-nothing merge for one account: the batch commits in one store
    /// transaction, then the cursor advances to `committed_through`. A
    /// storage failure aborts only this account's merge; prior rows and
    /// cursor stay intact.
    fn commit_account(
        &self,
        account_id: &str,
        transactions: &[Transaction],
        committed_through: OffsetDateTime,
        status: &mut SyncStatus,
    ) {
        if let Err(err) = self.try_commit(account_id, transactions, committed_through) {
            tracing::warn!(account = %account_id, error = %err, "merge aborted");
            mark_stale(status, account_id, &format!("merge aborted: {err}"));
        }
    }

    fn try_commit(
        &self,
        account_id: &str,
        transactions: &[Transaction],
        committed_through: OffsetDateTime,
    ) -> std::result::Result<(), StorageError> {
        self.store.upsert_transactions(account_id, transactions)?;
        self.store.advance_cursor(account_id, committed_through)?;
        tracing::debug!(
            account = %account_id,
            merged = transactions.len(),
            through = committed_through.unix_timestamp(),
            "account committed"
        );
        Ok(())
    }
}

fn degradable(err: &ProviderError) -> bool {
    matches!(
        err,
        ProviderError::Unavailable(_) | ProviderError::InvalidRequest(_)
    )
}

fn mark_stale(status: &mut SyncStatus, account_id: &str, reason: &str) {
    if !status.stale_accounts.iter().any(|id| id == account_id) {
        status.stale_accounts.push(account_id.to_string());
    }
    status.warnings.push(format!("account {account_id}: {reason}"));
}
