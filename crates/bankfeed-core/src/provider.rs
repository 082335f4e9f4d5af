use async_trait::async_trait;

use crate::error::ProviderError;
use crate::models::{AccessCredential, Account, TimeWindow, Transaction};

/// Capability interface for a financial-data aggregator.
///
/// Implementations speak one provider's wire protocol and nothing else: no
/// caching, no persistence. Adding an aggregator means adding an
/// implementation; the sync engine stays untouched.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short identifier for configs and logs, e.g. `"simplefin"`.
    fn name(&self) -> &str;

    /// One-shot exchange of a setup token for the durable credential. The
    /// caller hands the result to the vault; implementations never persist
    /// it themselves.
    async fn exchange_setup_token(&self, token: &str)
        -> Result<AccessCredential, ProviderError>;

    /// The full current account set, balances included.
    async fn list_accounts(
        &self,
        credential: &AccessCredential,
    ) -> Result<Vec<Account>, ProviderError>;

    /// Transactions for one account posted within `window`. The provider
    /// bounds how much history one request may span; implementations split
    /// the window into compliant sub-requests and concatenate the results.
    /// When later sub-windows fail after earlier ones succeeded, the error is
    /// `ProviderError::Partial` carrying everything retrieved plus the gap.
    async fn list_transactions(
        &self,
        credential: &AccessCredential,
        account_id: &str,
        window: TimeWindow,
    ) -> Result<Vec<Transaction>, ProviderError>;
}
