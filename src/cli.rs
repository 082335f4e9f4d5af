//! Command surface: human tables or `--json` machine output over the same
//! read API the dashboard server serves.

use prettytable::{row, Table};

use bankfeed_core::{Error, Result};

use crate::sync::{SyncService, SyncStatus};

pub async fn setup(service: &SyncService, provider: &str, token: &str) -> Result<()> {
    if provider != service.provider_name() {
        return Err(Error::Config(format!(
            "unsupported provider {:?}; available: {}",
            provider,
            service.provider_name()
        )));
    }
    service.setup(token).await?;
    println!("Success! {} configured.", service.provider_name());
    Ok(())
}

pub async fn accounts(service: &SyncService, json_out: bool) -> Result<()> {
    let view = service.get_accounts(false).await?;

    if json_out {
        println!("{}", to_json(&view)?);
        return Ok(());
    }

    print_status(&view.status);
    let mut table = Table::new();
    table.add_row(row!["Bank", "Account", "Currency", "Balance"]);
    for account in &view.accounts {
        table.add_row(row![
            account.org_name,
            account.name,
            account.currency,
            account.balance
        ]);
    }
    table.printstd();
    Ok(())
}

pub async fn transactions(service: &SyncService, days: i64, json_out: bool) -> Result<()> {
    let view = service.get_transactions(days, false).await?;

    if json_out {
        println!("{}", to_json(&view)?);
        return Ok(());
    }

    print_status(&view.status);
    let mut table = Table::new();
    table.add_row(row!["Date", "Payee", "Amount", ""]);
    for txn in &view.transactions {
        let payee = txn.payee.as_deref().unwrap_or(&txn.description);
        let marker = if txn.pending { "pending" } else { "" };
        table.add_row(row![txn.posted_at.date(), payee, txn.amount, marker]);
    }
    table.printstd();
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| Error::Config(e.to_string()))
}

fn print_status(status: &SyncStatus) {
    if status.refresh_in_progress {
        println!("(refresh in progress; showing last committed data)");
    }
    for warning in &status.warnings {
        eprintln!("warning: {warning}");
    }
    if !status.stale_accounts.is_empty() {
        eprintln!("stale accounts: {}", status.stale_accounts.join(", "));
    }
}
