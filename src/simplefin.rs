//! SimpleFin provider client.
//!
//! Speaks the SimpleFin bridge protocol: a one-time POST of the claimed
//! setup token yields the access URL, then `GET {access_url}/accounts` with
//! unix-second `start-date`/`end-date` bounds returns accounts with nested
//! transactions. The bridge caps how much history one request may span, so
//! ranged fetches are split into compliant sub-windows and concatenated.

use std::str::FromStr;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use tokio::time::sleep;

use bankfeed_core::{
    AccessCredential, Account, Provider, ProviderError, TimeWindow, Transaction,
};

const USER_AGENT: &str = concat!("bankfeed/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct SimpleFinConfig {
    /// Largest range the bridge accepts in one request.
    pub max_window_days: i64,
    pub request_timeout: StdDuration,
    /// Retry budget for transient failures; rejections are never retried.
    pub max_retries: u32,
    pub retry_base: StdDuration,
}

impl Default for SimpleFinConfig {
    fn default() -> Self {
        Self {
            max_window_days: 90,
            request_timeout: StdDuration::from_secs(30),
            max_retries: 3,
            retry_base: StdDuration::from_millis(500),
        }
    }
}

pub struct SimpleFin {
    config: SimpleFinConfig,
    client: Client,
}

impl SimpleFin {
    pub fn new(config: SimpleFinConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    async fn fetch_once(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<AccountSet, ProviderError> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::InvalidToken(format!("HTTP {status}")));
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(ProviderError::Unavailable(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(ProviderError::InvalidRequest(format!("HTTP {status}")));
        }

        resp.json::<AccountSet>()
            .await
            .map_err(|e| ProviderError::InvalidRequest(format!("invalid response body: {e}")))
    }

    async fn get_with_retry(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<AccountSet, ProviderError> {
        let mut attempt = 0u32;
        loop {
            match self.fetch_once(url, query).await {
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    let wait = self.config.retry_base * 2u32.pow(attempt);
                    tracing::debug!(
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "transient provider failure; retrying"
                    );
                    sleep(wait).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// One sub-window's transactions for one account, converted.
    async fn fetch_window(
        &self,
        credential: &AccessCredential,
        account_id: &str,
        window: TimeWindow,
    ) -> Result<Vec<Transaction>, ProviderError> {
        let url = accounts_url(credential);
        let query = [
            ("start-date", window.since.unix_timestamp().to_string()),
            ("end-date", window.until.unix_timestamp().to_string()),
            ("account", account_id.to_string()),
            ("pending", "1".to_string()),
        ];
        let set = self.get_with_retry(&url, &query).await?;
        log_bridge_errors(&set);

        let mut transactions = Vec::new();
        for account in set.accounts.into_iter().filter(|a| a.id == account_id) {
            for wire in account.transactions {
                transactions.push(wire.into_transaction(account_id)?);
            }
        }
        Ok(transactions)
    }
}

fn accounts_url(credential: &AccessCredential) -> String {
    format!("{}/accounts", credential.access_url.trim_end_matches('/'))
}

fn log_bridge_errors(set: &AccountSet) {
    for message in &set.errors {
        tracing::warn!(%message, "bridge reported an error");
    }
}

/// Decode a setup token into the claim URL it wraps.
fn claim_url_from_token(token: &str) -> Result<String, ProviderError> {
    let token = token.trim();
    let token = token.strip_prefix("sfin:").unwrap_or(token);
    let decoded = BASE64
        .decode(token)
        .map_err(|_| ProviderError::InvalidToken("setup token is not valid base64".to_string()))?;
    let url = String::from_utf8(decoded)
        .map_err(|_| ProviderError::InvalidToken("claim URL is not UTF-8".to_string()))?
        .trim()
        .to_string();
    if !url.starts_with("http") {
        return Err(ProviderError::InvalidToken(
            "setup token does not wrap a claim URL".to_string(),
        ));
    }
    Ok(url)
}

/// Split `window` into contiguous sub-windows no longer than `max_days`.
/// Each piece starts where the previous one ended and the last ends exactly
/// at `window.until`, so their concatenation covers the input with no gaps
/// or overlaps.
fn split_windows(window: TimeWindow, max_days: i64) -> Vec<TimeWindow> {
    let max_span = Duration::days(max_days.max(1));
    let mut windows = Vec::new();
    let mut start = window.since;
    while start < window.until {
        let end = (start + max_span).min(window.until);
        windows.push(TimeWindow::new(start, end));
        start = end;
    }
    windows
}

#[async_trait]
impl Provider for SimpleFin {
    fn name(&self) -> &str {
        "simplefin"
    }

    async fn exchange_setup_token(
        &self,
        token: &str,
    ) -> Result<AccessCredential, ProviderError> {
        let claim_url = claim_url_from_token(token)?;
        let resp = self
            .client
            .post(&claim_url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if status.is_client_error() {
            return Err(ProviderError::InvalidToken(format!(
                "claim rejected: HTTP {status}"
            )));
        }
        if !status.is_success() {
            return Err(ProviderError::Unavailable(format!(
                "claim failed: HTTP {status}"
            )));
        }

        let access_url = resp
            .text()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?
            .trim()
            .to_string();
        if access_url.is_empty() {
            return Err(ProviderError::InvalidToken(
                "claim returned an empty access URL".to_string(),
            ));
        }
        tracing::info!("setup token exchanged for access credential");
        Ok(AccessCredential::new(access_url))
    }

    async fn list_accounts(
        &self,
        credential: &AccessCredential,
    ) -> Result<Vec<Account>, ProviderError> {
        // Starting the range at `now` asks the bridge for balances without
        // transaction bodies.
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let set = self
            .get_with_retry(&accounts_url(credential), &[("start-date", now.to_string())])
            .await?;
        log_bridge_errors(&set);

        set.accounts
            .into_iter()
            .map(WireAccount::into_account)
            .collect()
    }

    async fn list_transactions(
        &self,
        credential: &AccessCredential,
        account_id: &str,
        window: TimeWindow,
    ) -> Result<Vec<Transaction>, ProviderError> {
        let mut fetched: Vec<Transaction> = Vec::new();
        for (i, sub) in split_windows(window, self.config.max_window_days)
            .into_iter()
            .enumerate()
        {
            match self.fetch_window(credential, account_id, sub).await {
                Ok(mut rows) => fetched.append(&mut rows),
                Err(err) if i > 0 && err.is_retryable() => {
                    // Hand back what already arrived; the unfetched gap runs
                    // from this sub-window to the end of the request.
                    tracing::warn!(account = account_id, gap = %sub, error = %err,
                        "sub-window fetch failed after partial success");
                    return Err(ProviderError::Partial {
                        fetched,
                        unfetched: TimeWindow::new(sub.since, window.until),
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Ok(fetched)
    }
}

// Wire types, as the bridge serializes them.

#[derive(Debug, Deserialize)]
struct AccountSet {
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    accounts: Vec<WireAccount>,
}

#[derive(Debug, Deserialize)]
struct WireAccount {
    id: String,
    name: String,
    #[serde(default = "default_currency")]
    currency: String,
    balance: String,
    #[serde(rename = "balance-date")]
    balance_date: i64,
    #[serde(default)]
    org: WireOrg,
    #[serde(default)]
    transactions: Vec<WireTransaction>,
}

#[derive(Debug, Default, Deserialize)]
struct WireOrg {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireTransaction {
    id: String,
    posted: i64,
    amount: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    payee: Option<String>,
    #[serde(default)]
    pending: bool,
}

fn default_currency() -> String {
    "USD".to_string()
}

/// Bridge amounts are decimal strings, sometimes with thousands separators.
fn parse_amount(raw: &str) -> Result<Decimal, ProviderError> {
    let cleaned = raw.replace(',', "");
    Decimal::from_str(&cleaned)
        .map_err(|e| ProviderError::InvalidRequest(format!("unparseable amount {raw:?}: {e}")))
}

fn parse_timestamp(ts: i64) -> Result<OffsetDateTime, ProviderError> {
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|e| ProviderError::InvalidRequest(format!("bad timestamp {ts}: {e}")))
}

impl WireAccount {
    fn into_account(self) -> Result<Account, ProviderError> {
        Ok(Account {
            balance: parse_amount(&self.balance)?,
            balance_as_of: parse_timestamp(self.balance_date)?,
            id: self.id,
            name: self.name,
            org_name: self.org.name.unwrap_or_else(|| "Unknown Bank".to_string()),
            currency: self.currency,
        })
    }
}

impl WireTransaction {
    fn into_transaction(self, account_id: &str) -> Result<Transaction, ProviderError> {
        let description = self
            .description
            .clone()
            .or_else(|| self.payee.clone())
            .unwrap_or_else(|| "Unknown".to_string());
        Ok(Transaction {
            posted_at: parse_timestamp(self.posted)?,
            amount: parse_amount(&self.amount)?,
            id: self.id,
            account_id: account_id.to_string(),
            description,
            payee: self.payee,
            pending: self.pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::macros::datetime;

    #[test]
    fn splits_long_range_into_exact_cover() {
        let window = TimeWindow::new(
            datetime!(2023-01-01 00:00 UTC),
            datetime!(2024-02-05 00:00 UTC), // 400 days
        );
        let windows = split_windows(window, 90);

        assert_eq!(windows.len(), 5);
        assert_eq!(windows[0].since, window.since);
        assert_eq!(windows.last().unwrap().until, window.until);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].until, pair[1].since);
        }
        for sub in &windows {
            assert!(sub.duration() <= Duration::days(90));
        }
    }

    #[test]
    fn short_range_is_one_window() {
        let window = TimeWindow::new(
            datetime!(2024-01-01 00:00 UTC),
            datetime!(2024-01-08 00:00 UTC),
        );
        let windows = split_windows(window, 90);
        assert_eq!(windows, vec![window]);
    }

    #[test]
    fn claim_url_decodes_with_prefix_and_whitespace() {
        let url = "https://bridge.example/claim/demo";
        let token = format!("sfin:{}", BASE64.encode(url));
        assert_eq!(claim_url_from_token(&token).unwrap(), url);
        assert_eq!(claim_url_from_token(format!("  {token}  ").trim()).unwrap(), url);
    }

    #[test]
    fn malformed_token_is_invalid_token() {
        assert!(matches!(
            claim_url_from_token("!!not-base64!!"),
            Err(ProviderError::InvalidToken(_))
        ));
        // Valid base64 that does not wrap a URL.
        let token = BASE64.encode("hello world");
        assert!(matches!(
            claim_url_from_token(&token),
            Err(ProviderError::InvalidToken(_))
        ));
    }

    #[test]
    fn amounts_parse_with_separators() {
        assert_eq!(parse_amount("1,200.50").unwrap(), dec!(1200.50));
        assert_eq!(parse_amount("-42.10").unwrap(), dec!(-42.10));
        assert!(parse_amount("twelve").is_err());
    }

    #[test]
    fn wire_account_set_parses() {
        let body = r#"{
            "errors": ["Connection to Demo Bank may need attention"],
            "accounts": [{
                "id": "acc1",
                "name": "Checking",
                "currency": "USD",
                "balance": "1,200.50",
                "balance-date": 1704067200,
                "org": { "name": "Demo Bank" },
                "transactions": [{
                    "id": "t1",
                    "posted": 1704060000,
                    "amount": "-4.50",
                    "description": "Coffee",
                    "payee": "Cafe",
                    "pending": true
                }]
            }]
        }"#;

        let set: AccountSet = serde_json::from_str(body).unwrap();
        assert_eq!(set.errors.len(), 1);

        let account = set.accounts.into_iter().next().unwrap();
        let transactions = account.transactions.len();
        assert_eq!(transactions, 1);

        let wire_txn = WireTransaction {
            id: "t1".to_string(),
            posted: 1704060000,
            amount: "-4.50".to_string(),
            description: None,
            payee: Some("Cafe".to_string()),
            pending: false,
        };
        let txn = wire_txn.into_transaction("acc1").unwrap();
        // Payee backfills a missing description.
        assert_eq!(txn.description, "Cafe");
        assert_eq!(txn.amount, dec!(-4.50));

        let converted = account.into_account().unwrap();
        assert_eq!(converted.org_name, "Demo Bank");
        assert_eq!(converted.balance, dec!(1200.50));
        assert_eq!(converted.balance_as_of.unix_timestamp(), 1704067200);
    }
}
