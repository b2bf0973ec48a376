use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::domain::{
    build_integrity_report, parse_amount, IntegrityReport, TokenAmount, TransferRecord, Wallet,
};
use crate::storage::{Repository, StoreOptions, TransferOutcome};

use super::LedgerError;

/// Application service providing the ledger operations.
/// This is the only interface a transport shell (CLI, API, ...) should use.
///
/// The service holds no balance state of its own; every call goes to the store,
/// so several processes may share one database.
pub struct LedgerService {
    repo: Repository,
    default_deadline: Option<Duration>,
}

/// A committed transfer together with the sender's balance after it.
#[derive(Debug, Clone)]
pub struct TransferReceipt {
    pub record: TransferRecord,
    pub sender_balance: TokenAmount,
}

impl LedgerService {
    /// Create a new ledger service with the given repository.
    pub fn new(repo: Repository) -> Self {
        Self {
            repo,
            default_deadline: None,
        }
    }

    /// Apply `deadline` to every `transfer` call that does not pass its own.
    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = Some(deadline);
        self
    }

    /// Connect to the database at `database_url`, migrate it and seed the bootstrap wallet.
    pub async fn init(database_url: &str) -> Result<Self, LedgerError> {
        Self::init_with(database_url, &StoreOptions::default()).await
    }

    pub async fn init_with(
        database_url: &str,
        options: &StoreOptions,
    ) -> Result<Self, LedgerError> {
        let repo = Repository::init(database_url, options).await?;

        let seed = Wallet::seed();
        if repo.insert_wallet_if_absent(&seed).await? {
            info!(address = %seed.address, balance = %seed.balance, "Seeded bootstrap wallet");
        }

        Ok(Self::new(repo))
    }

    /// Connect to an existing database.
    pub async fn connect(database_url: &str) -> Result<Self, LedgerError> {
        Self::connect_with(database_url, &StoreOptions::default()).await
    }

    pub async fn connect_with(
        database_url: &str,
        options: &StoreOptions,
    ) -> Result<Self, LedgerError> {
        let repo = Repository::connect(database_url, options).await?;
        Ok(Self::new(repo))
    }

    pub async fn close(&self) {
        self.repo.close().await;
    }

    // ========================
    // Wallet operations
    // ========================

    /// Get a wallet by address, `None` if it has never been created.
    pub async fn get_wallet(&self, address: &str) -> Result<Option<Wallet>, LedgerError> {
        Ok(self.repo.get_wallet(address).await?)
    }

    /// Current committed balance of a wallet.
    pub async fn get_balance(&self, address: &str) -> Result<TokenAmount, LedgerError> {
        self.repo
            .get_wallet(address)
            .await?
            .map(|wallet| wallet.balance)
            .ok_or_else(|| LedgerError::WalletNotFound(address.to_string()))
    }

    /// Create a wallet or overwrite its balance. Bootstrap and test use only.
    pub async fn set_wallet(&self, address: &str, balance: &str) -> Result<Wallet, LedgerError> {
        let balance: TokenAmount = balance.parse().map_err(|reason| LedgerError::InvalidAmount {
            input: balance.to_string(),
            reason,
        })?;

        let wallet = self.repo.upsert_wallet(address, &balance).await?;
        debug!(address, balance = %wallet.balance, "Wallet balance set");
        Ok(wallet)
    }

    pub async fn list_wallets(&self) -> Result<Vec<Wallet>, LedgerError> {
        Ok(self.repo.list_wallets().await?)
    }

    /// Exact sum of all balances. Only seeding and `set_wallet` change it.
    pub async fn total_supply(&self) -> Result<TokenAmount, LedgerError> {
        Ok(self.repo.total_supply().await?)
    }

    // ========================
    // Transfer operations
    // ========================

    /// Move `amount` (a decimal integer string) from one wallet to another.
    /// Returns the sender's new balance.
    pub async fn transfer(
        &self,
        from_address: &str,
        to_address: &str,
        amount: &str,
    ) -> Result<TokenAmount, LedgerError> {
        let receipt = self.transfer_record(from_address, to_address, amount).await?;
        Ok(receipt.sender_balance)
    }

    /// Like [`transfer`](Self::transfer), but abandons the call if it has not reached
    /// commit once `deadline` has passed. The abandoned transaction is rolled back.
    pub async fn transfer_within(
        &self,
        from_address: &str,
        to_address: &str,
        amount: &str,
        deadline: Duration,
    ) -> Result<TokenAmount, LedgerError> {
        let receipt = self
            .execute_transfer(from_address, to_address, amount, Some(deadline))
            .await?;
        Ok(receipt.sender_balance)
    }

    /// Same as [`transfer`](Self::transfer), returning the appended history record as well.
    pub async fn transfer_record(
        &self,
        from_address: &str,
        to_address: &str,
        amount: &str,
    ) -> Result<TransferReceipt, LedgerError> {
        self.execute_transfer(from_address, to_address, amount, self.default_deadline)
            .await
    }

    async fn execute_transfer(
        &self,
        from_address: &str,
        to_address: &str,
        amount_str: &str,
        deadline: Option<Duration>,
    ) -> Result<TransferReceipt, LedgerError> {
        let amount = parse_amount(amount_str).map_err(|reason| {
            warn!(
                from = from_address,
                to = to_address,
                amount = amount_str,
                %reason,
                "Rejected transfer amount"
            );
            LedgerError::InvalidAmount {
                input: amount_str.to_string(),
                reason,
            }
        })?;

        // The deadline bounds the checks and writes only. Once COMMIT is sent the
        // call reports what the store did, so a timeout always means nothing changed.
        let prepare = self
            .repo
            .prepare_transfer(from_address, to_address, &amount, deadline);
        let prepared = match deadline {
            Some(limit) => tokio::time::timeout(limit, prepare)
                .await
                .with_context(|| format!("Transfer deadline of {}ms exceeded", limit.as_millis()))
                .inspect_err(|_| {
                    warn!(
                        from = from_address,
                        to = to_address,
                        %amount,
                        "Transfer timed out, rolled back"
                    );
                })??,
            None => prepare.await?,
        };
        let outcome = prepared.commit().await?;

        match outcome {
            TransferOutcome::Committed {
                record,
                sender_balance,
            } => {
                info!(
                    transfer_id = record.id,
                    from = from_address,
                    to = to_address,
                    %amount,
                    %sender_balance,
                    "Transfer committed"
                );
                Ok(TransferReceipt {
                    record,
                    sender_balance,
                })
            }
            TransferOutcome::SenderNotFound => {
                debug!(from = from_address, "Transfer rejected: sender not found");
                Err(LedgerError::SenderNotFound(from_address.to_string()))
            }
            TransferOutcome::InsufficientBalance { balance } => {
                debug!(
                    from = from_address,
                    %balance,
                    %amount,
                    "Transfer rejected: insufficient balance"
                );
                Err(LedgerError::InsufficientBalance {
                    address: from_address.to_string(),
                    balance,
                    required: amount,
                })
            }
        }
    }

    /// List transfers in id order; with `limit`, only the most recent ones.
    pub async fn list_transfers(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<TransferRecord>, LedgerError> {
        Ok(self.repo.list_transfers(limit).await?)
    }

    /// List transfers that debited or credited `address`.
    pub async fn list_transfers_for_wallet(
        &self,
        address: &str,
    ) -> Result<Vec<TransferRecord>, LedgerError> {
        Ok(self.repo.list_transfers_for_wallet(address).await?)
    }

    // ========================
    // Integrity operations
    // ========================

    /// Check ledger integrity and return a report.
    pub async fn check_integrity(&self) -> Result<IntegrityReport, LedgerError> {
        let stats = self.repo.get_integrity_stats().await?;
        let total_supply = self.repo.total_supply().await?;
        Ok(build_integrity_report(&stats, total_supply))
    }
}
