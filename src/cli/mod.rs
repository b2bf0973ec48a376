use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;

use crate::application::{ErrorKind, LedgerError, LedgerService};
use crate::domain::{TransferRecord, Wallet};
use crate::logging::init_logging;
use crate::storage::StoreOptions;

/// Wallet Ledger - token balances with atomic transfers
#[derive(Parser)]
#[command(name = "wallet-ledger")]
#[command(about = "A token balance ledger with atomic, race-safe wallet transfers")]
#[command(version)]
pub struct Cli {
    /// PostgreSQL connection URL
    #[arg(short, long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Schema holding the ledger tables
    #[arg(long, env = "WALLET_LEDGER_SCHEMA")]
    pub schema: Option<String>,

    /// Abort a transfer that has not committed within this many milliseconds
    #[arg(long, env = "WALLET_LEDGER_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// How long to wait for a free database connection
    #[arg(long, env = "WALLET_LEDGER_ACQUIRE_TIMEOUT_MS", default_value = "5000")]
    pub acquire_timeout_ms: u64,

    /// Maximum pooled database connections
    #[arg(long, env = "WALLET_LEDGER_MAX_CONNECTIONS", default_value = "10")]
    pub max_connections: u32,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the database and seed the bootstrap wallet
    Init,

    /// Show the balance of a wallet
    Balance {
        /// Wallet address
        address: String,
    },

    /// Show a wallet
    Wallet {
        /// Wallet address
        address: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List all wallets
    Wallets,

    /// Create a wallet or overwrite its balance (bootstrap/testing)
    SetWallet {
        /// Wallet address
        address: String,

        /// New balance, a non-negative integer
        balance: String,
    },

    /// Move tokens from one wallet to another
    Transfer {
        /// Amount to transfer, a positive integer
        amount: String,

        /// Source wallet address
        #[arg(long)]
        from: String,

        /// Destination wallet address (created if missing)
        #[arg(long)]
        to: String,

        /// Print a JSON response object instead of text
        #[arg(long)]
        json: bool,
    },

    /// List transfer history
    Transfers {
        /// Filter by wallet address
        #[arg(long)]
        wallet: Option<String>,

        /// Show only the most recent transfers
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Verify ledger integrity
    Check,
}

impl Cli {
    fn store_options(&self) -> StoreOptions {
        StoreOptions {
            max_connections: self.max_connections,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            schema: self.schema.clone(),
        }
    }

    async fn connect(&self) -> Result<LedgerService> {
        let mut service =
            LedgerService::connect_with(&self.database_url, &self.store_options()).await?;
        if let Some(ms) = self.timeout_ms {
            service = service.with_default_deadline(Duration::from_millis(ms));
        }
        Ok(service)
    }

    pub async fn run(self) -> Result<()> {
        init_logging(self.verbose);

        let service = if matches!(self.command, Commands::Init) {
            let service =
                LedgerService::init_with(&self.database_url, &self.store_options()).await?;
            println!("Database initialized");
            service
        } else {
            self.connect().await?
        };

        let result = run_command(&service, self.command).await;
        service.close().await;
        result
    }
}

async fn run_command(service: &LedgerService, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {
            let supply = service.total_supply().await?;
            println!("Total supply: {}", supply);
        }

        Commands::Balance { address } => {
            let balance = service.get_balance(&address).await?;
            println!("{}", balance);
        }

        Commands::Wallet { address, json } => match service.get_wallet(&address).await? {
            Some(wallet) if json => println!("{}", serde_json::to_string_pretty(&wallet)?),
            Some(wallet) => print_wallet(&wallet),
            None if json => println!("null"),
            None => bail!("wallet not found: {}", address),
        },

        Commands::Wallets => {
            let wallets = service.list_wallets().await?;
            if wallets.is_empty() {
                println!("No wallets found.");
            } else {
                println!("{:<44} {:>30}", "ADDRESS", "BALANCE");
                println!("{}", "-".repeat(75));
                for wallet in wallets {
                    println!("{:<44} {:>30}", wallet.address, wallet.balance);
                }
            }
        }

        Commands::SetWallet { address, balance } => {
            let wallet = service.set_wallet(&address, &balance).await?;
            println!("Set wallet {} to {}", wallet.address, wallet.balance);
        }

        Commands::Transfer {
            amount,
            from,
            to,
            json,
        } => {
            let result = service.transfer(&from, &to, &amount).await;
            if json {
                let body = match &result {
                    Ok(balance) => json!({ "data": { "transfer": { "balance": balance } } }),
                    Err(err) => json!({ "errors": [{ "message": user_message(err) }] }),
                };
                println!("{}", serde_json::to_string_pretty(&body)?);
                return Ok(());
            }
            match result {
                Ok(balance) => println!(
                    "Transferred {} {} -> {}; sender balance {}",
                    amount, from, to, balance
                ),
                Err(err) => bail!(user_message(&err)),
            }
        }

        Commands::Transfers { wallet, limit } => {
            let transfers = match wallet {
                Some(address) => service.list_transfers_for_wallet(&address).await?,
                None => service.list_transfers(limit).await?,
            };
            print_transfers(&transfers);
        }

        Commands::Check => run_check_command(service).await?,
    }

    Ok(())
}

/// Text shown to a user for a failed call.
/// Rejections get fixed messages; only genuine store failures carry their cause.
pub fn user_message(err: &LedgerError) -> String {
    match err.kind() {
        ErrorKind::InvalidAmount => "invalid amount".to_string(),
        ErrorKind::SenderNotFound => "sender wallet does not exist".to_string(),
        ErrorKind::InsufficientBalance => "insufficient balance".to_string(),
        ErrorKind::WalletNotFound => "wallet not found".to_string(),
        ErrorKind::StoreFailure if err.is_timeout() => "transfer timed out".to_string(),
        ErrorKind::StoreFailure => err.to_string(),
    }
}

fn print_wallet(wallet: &Wallet) {
    println!("Wallet: {}", wallet.address);
    println!("  Balance:  {}", wallet.balance);
    println!("  Created:  {}", wallet.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Updated:  {}", wallet.updated_at.format("%Y-%m-%d %H:%M:%S"));
}

fn print_transfers(transfers: &[TransferRecord]) {
    if transfers.is_empty() {
        println!("No transfers found.");
        return;
    }

    println!(
        "{:>6}  {:<19}  {:<44} {:<44} {:>20}",
        "ID", "DATE", "FROM", "TO", "AMOUNT"
    );
    println!("{}", "-".repeat(139));
    for t in transfers {
        println!(
            "{:>6}  {:<19}  {:<44} {:<44} {:>20}",
            t.id,
            t.created_at.format("%Y-%m-%d %H:%M:%S"),
            t.from_address,
            t.to_address,
            t.amount
        );
    }
}

async fn run_check_command(service: &LedgerService) -> Result<()> {
    println!("Checking ledger integrity...\n");

    let report = service.check_integrity().await?;

    println!("Wallets:      {}", report.wallet_count);
    println!("Transfers:    {}", report.transfer_count);
    println!("Total supply: {}", report.total_supply);
    println!();

    if report.is_healthy() {
        println!("Ledger is consistent.");
    } else {
        println!("Issues found:");
        for issue in &report.issues {
            println!("  - {}", issue);
        }
        bail!("Ledger integrity check failed");
    }

    Ok(())
}
