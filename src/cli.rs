use clap::{Parser, Subcommand};
use std::sync::Arc;

use crate::config::PricingConfig;
use crate::domain::{CounterName, LoanId, OracleRate};
use crate::engine::{EngineNotification, Snapshot};
use crate::error::Result;
use crate::services::{MetadataFetcher, PriceConverter};

#[derive(Parser)]
#[command(name = "microloan-sync")]
#[command(version = "0.1.0")]
#[command(about = "Ledger-backed micro-loan reconciliation and price synchronization", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory (default.toml plus an optional per-environment file)
    #[arg(short, long, default_value = "config")]
    pub config: String,

    /// Override gateway.dry_run from the config
    #[arg(long, env = "MICROLOAN_DRY_RUN")]
    pub dry_run: Option<bool>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Follow the live ledger and print every reconciled snapshot
    Watch {
        /// Ledger bridge WebSocket URL (overrides config)
        #[arg(long)]
        ledger_url: Option<String>,
        /// Print snapshots as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Offline closed loop: in-memory ledger, static catalog, discover, add and lend
    Demo {
        /// Ledger units lent to the promoted candidate
        #[arg(long, default_value = "2000")]
        lend_amount: u64,
        /// Raw oracle answer (8 decimals) seeded into the ledger
        #[arg(long, default_value = "184512000000")]
        rate: i128,
    },
    /// Fetch one random fundraising loan from the metadata service
    Discover {
        /// Loan ids to skip
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<LoanId>,
    },
    /// Convert a ledger amount to display units and currency
    Convert {
        /// Amount in ledger fixed-point units
        amount: u64,
        /// Raw oracle answer (8 decimals); omitted means unavailable
        #[arg(long)]
        rate: Option<i128>,
    },
}

fn loan_status(snapshot: &Snapshot, converter: &PriceConverter, id: LoanId) -> &'static str {
    match snapshot.loan(id) {
        Some(_) if snapshot.is_pending(id) => "\x1b[33mloading\x1b[0m",
        Some(loan) if converter.is_fully_funded(loan, snapshot.oracle_rate) => "\x1b[32mfunded\x1b[0m",
        Some(_) => "fundraising",
        None => "-",
    }
}

pub fn print_snapshot(snapshot: &Snapshot, converter: &PriceConverter) {
    println!(
        "\x1b[36m── snapshot v{} ({}) ──\x1b[0m",
        snapshot.version,
        snapshot.taken_at.format("%H:%M:%S")
    );
    println!(
        "   Oracle price:  {}",
        converter.oracle_price(snapshot.oracle_rate)
    );
    for name in CounterName::ALL {
        let value = snapshot
            .counters
            .get(name)
            .map(|v| converter.to_display_unit(v).to_string())
            .unwrap_or_else(|| "n/a".to_string());
        println!("   {:<14} {}", format!("{}:", name), value);
    }

    if snapshot.loans.is_empty() {
        println!("   (no loans on the ledger)");
    } else {
        println!(
            "\n   {:>9}  {:<14} {:<3} {:>8} {:>10} {:>10} {:>10}  {}",
            "ID", "NAME", "CC", "TARGET", "FUNDED", "VALUE", "PAID", "STATUS"
        );
        for loan in &snapshot.loans {
            println!(
                "   {:>9}  {:<14} {:<3} {:>8} {:>10} {:>10} {:>10}  {}",
                loan.id,
                if loan.name.is_empty() { "…" } else { loan.name.as_str() },
                loan.country_code.as_deref().unwrap_or("-"),
                loan.target_amount,
                converter.to_display_unit(loan.funded_amount).to_string(),
                converter.to_display_currency(loan.funded_amount, snapshot.oracle_rate),
                converter.to_display_unit(loan.paid_back_amount).to_string(),
                loan_status(snapshot, converter, loan.id)
            );
        }
    }

    if let Some(candidate) = &snapshot.candidate {
        println!(
            "\n   \x1b[35mCandidate:\x1b[0m #{} {} ({}) target {}",
            candidate.id,
            candidate.name,
            candidate.country_code.as_deref().unwrap_or("-"),
            candidate.target_amount
        );
    }

    for entry in &snapshot.submissions {
        println!("   tx {} {} -> {}", entry.id, entry.call, entry.status);
    }

    if let Some(error) = &snapshot.last_error {
        println!("   \x1b[31m⚠ {}\x1b[0m", error);
    }
    println!();
}

pub fn print_notification(notification: &EngineNotification) {
    let color = if notification.is_error() { "31" } else { "32" };
    let text = match notification {
        EngineNotification::SubscriptionFailed { topic, reason } => {
            format!("subscription {} failed: {}", topic, reason)
        }
        EngineNotification::MetadataFetchFailed { ids, error } => {
            format!("metadata for {:?} failed: {}", ids, error)
        }
        EngineNotification::CandidateFailed { error } => format!("discovery failed: {}", error),
        EngineNotification::CandidatePromoted { loan_id } => {
            format!("candidate #{} confirmed on the ledger", loan_id)
        }
        EngineNotification::CandidateRetired { loan_id } => {
            format!("candidate #{} retired, discover again", loan_id)
        }
        EngineNotification::Submission { id, call, status } => {
            format!("{} [{}] {}", call, id, status)
        }
    };
    println!("\x1b[{}m• {}\x1b[0m", color, text);
}

pub fn convert_amount(amount: u64, rate: Option<i128>, pricing: &PricingConfig) -> Result<()> {
    let converter = PriceConverter::new(pricing);
    let rate = rate.map(OracleRate::from_raw);

    println!("\x1b[33mConversion:\x1b[0m");
    println!("   Ledger amount:     {}", amount);
    println!("   Display units:     {}", converter.to_display_unit(amount));
    println!("   Oracle price:      {}", converter.oracle_price(rate));
    println!("   Display currency:  {}", converter.to_display_currency(amount, rate));
    Ok(())
}

pub async fn discover_once(fetcher: Arc<MetadataFetcher>, exclude: &[LoanId]) -> Result<()> {
    println!("Discovering a fundraising loan...\n");
    let candidate = fetcher.fetch_random_candidate(exclude).await?;

    println!("   ID:          {}", candidate.id);
    println!("   Name:        {}", candidate.name);
    println!(
        "   Country:     {}",
        candidate.country_code.as_deref().unwrap_or("-")
    );
    println!("   Target:      {}", candidate.target_amount);
    if let Some(url) = &candidate.image_url {
        println!("   Image:       {}", url);
    }
    if !candidate.description.is_empty() {
        let preview: String = candidate.description.chars().take(160).collect();
        println!("   Description: {}", preview);
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LoanDescription, LoanRecord, NumericState};

    #[test]
    fn test_demo_defaults() {
        let cli = Cli::try_parse_from(["microloan-sync", "demo"]).unwrap();
        match cli.command {
            Commands::Demo { lend_amount, rate } => {
                assert_eq!(lend_amount, 2000);
                assert_eq!(rate, 184_512_000_000);
            }
            _ => panic!("expected demo"),
        }
        assert_eq!(cli.config, "config");
    }

    #[test]
    fn test_discover_exclude_is_comma_separated() {
        let cli =
            Cli::try_parse_from(["microloan-sync", "discover", "--exclude", "1,2,7"]).unwrap();
        match cli.command {
            Commands::Discover { exclude } => assert_eq!(exclude, vec![1, 2, 7]),
            _ => panic!("expected discover"),
        }
    }

    #[test]
    fn test_convert_rejects_negative_amount() {
        assert!(Cli::try_parse_from(["microloan-sync", "convert", "-5"]).is_err());
    }

    #[test]
    fn test_loan_status() {
        let converter = PriceConverter::default();
        let mut record = LoanRecord::placeholder(9);
        record.merge_description(&LoanDescription {
            id: 9,
            name: "Amina".into(),
            description: String::new(),
            image_url: None,
            country_code: Some("KE".into()),
            target_amount: 10,
        });
        record.apply_numeric(NumericState::new(10_000, 0));

        let mut snapshot = Snapshot::empty();
        snapshot.loans.push(record);
        assert_eq!(loan_status(&snapshot, &converter, 9), "fundraising");
        assert_eq!(loan_status(&snapshot, &converter, 4), "-");

        snapshot.oracle_rate = Some(OracleRate::from_raw(100_000_000));
        assert!(loan_status(&snapshot, &converter, 9).contains("funded"));
    }
}
