use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::domain::{IntegrityStats, TokenAmount, TransferRecord, Wallet};

use super::MIGRATION_001_INITIAL;

/// Connection settings for the backing store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub max_connections: u32,
    /// How long a call waits for a free pooled connection
    pub acquire_timeout: Duration,
    /// Schema holding the ledger tables; the server default when unset
    pub schema: Option<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            schema: None,
        }
    }
}

/// What the transfer transaction decided.
#[derive(Debug, Clone)]
pub enum TransferOutcome {
    Committed {
        record: TransferRecord,
        sender_balance: TokenAmount,
    },
    SenderNotFound,
    InsufficientBalance {
        balance: TokenAmount,
    },
}

/// A transfer whose checks ran inside an open transaction.
/// Rejections are already rolled back. A staged transfer keeps its row locks
/// until [`commit`](PreparedTransfer::commit), or until it is dropped, which rolls it back.
pub enum PreparedTransfer {
    Staged(StagedTransfer),
    SenderNotFound,
    InsufficientBalance { balance: TokenAmount },
}

/// Debit, credit and history row written but not yet committed.
pub struct StagedTransfer {
    tx: Transaction<'static, Postgres>,
    record: TransferRecord,
    sender_balance: TokenAmount,
}

impl PreparedTransfer {
    pub async fn commit(self) -> Result<TransferOutcome> {
        match self {
            PreparedTransfer::Staged(staged) => {
                staged.tx.commit().await.context("Failed to commit transfer")?;
                Ok(TransferOutcome::Committed {
                    record: staged.record,
                    sender_balance: staged.sender_balance,
                })
            }
            PreparedTransfer::SenderNotFound => Ok(TransferOutcome::SenderNotFound),
            PreparedTransfer::InsufficientBalance { balance } => {
                Ok(TransferOutcome::InsufficientBalance { balance })
            }
        }
    }
}

/// Repository for persisting and querying wallets and transfers.
pub struct Repository {
    pool: PgPool,
    schema: Option<String>,
}

impl Repository {
    /// Connect to a PostgreSQL database.
    pub async fn connect(database_url: &str, options: &StoreOptions) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {}", database_url))?;
        if let Some(schema) = &options.schema {
            check_schema_name(schema)?;
            connect_options = connect_options.options([("search_path", schema.as_str())]);
        }

        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect_with(connect_options)
            .await
            .context("Failed to connect to database")?;

        Ok(Self {
            pool,
            schema: options.schema.clone(),
        })
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        if let Some(schema) = &self.schema {
            sqlx::raw_sql(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to create schema {}", schema))?;
        }

        sqlx::raw_sql(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;
        Ok(())
    }

    /// Initialize a database (connect + migrate).
    pub async fn init(database_url: &str, options: &StoreOptions) -> Result<Self> {
        let repo = Self::connect(database_url, options).await?;
        repo.migrate().await?;
        Ok(repo)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ========================
    // Wallet operations
    // ========================

    /// Insert a wallet unless its address is already taken.
    /// Returns true if the row was created.
    pub async fn insert_wallet_if_absent(&self, wallet: &Wallet) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO wallets (address, balance, created_at, updated_at)
            VALUES ($1, $2::numeric, $3, $4)
            ON CONFLICT (address) DO NOTHING
            "#,
        )
        .bind(&wallet.address)
        .bind(wallet.balance.to_string())
        .bind(wallet.created_at)
        .bind(wallet.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert wallet")?;

        Ok(result.rows_affected() > 0)
    }

    /// Create a wallet or overwrite its balance.
    /// Only bootstrap and test fixtures write balances outside of a transfer.
    pub async fn upsert_wallet(&self, address: &str, balance: &TokenAmount) -> Result<Wallet> {
        let row = sqlx::query(
            r#"
            INSERT INTO wallets (address, balance, created_at, updated_at)
            VALUES ($1, $2::numeric, $3, $3)
            ON CONFLICT (address) DO UPDATE
                SET balance = EXCLUDED.balance, updated_at = EXCLUDED.updated_at
            RETURNING address, balance::text AS balance, created_at, updated_at
            "#,
        )
        .bind(address)
        .bind(balance.to_string())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("Failed to set wallet")?;

        Self::row_to_wallet(&row)
    }

    /// Get a wallet by address.
    pub async fn get_wallet(&self, address: &str) -> Result<Option<Wallet>> {
        let row = sqlx::query(
            r#"
            SELECT address, balance::text AS balance, created_at, updated_at
            FROM wallets
            WHERE address = $1
            "#,
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch wallet")?;

        match row {
            Some(row) => Ok(Some(Self::row_to_wallet(&row)?)),
            None => Ok(None),
        }
    }

    /// List all wallets ordered by address.
    pub async fn list_wallets(&self) -> Result<Vec<Wallet>> {
        let rows = sqlx::query(
            r#"
            SELECT address, balance::text AS balance, created_at, updated_at
            FROM wallets
            ORDER BY address
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list wallets")?;

        rows.iter().map(Self::row_to_wallet).collect()
    }

    /// Exact sum of every wallet balance.
    pub async fn total_supply(&self) -> Result<TokenAmount> {
        let total: String =
            sqlx::query("SELECT COALESCE(SUM(balance), 0)::text AS total FROM wallets")
                .fetch_one(&self.pool)
                .await
                .context("Failed to sum balances")?
                .get("total");

        parse_stored_amount(total)
    }

    fn row_to_wallet(row: &PgRow) -> Result<Wallet> {
        Ok(Wallet {
            address: row.get("address"),
            balance: parse_stored_amount(row.get("balance"))?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    // ========================
    // Transfer operations
    // ========================

    /// Check and write a transfer inside a transaction, leaving the commit to the caller.
    ///
    /// The sender and receiver rows that already exist are locked with `FOR UPDATE`
    /// in address order. Two transfers over the same pair in opposite directions
    /// queue instead of deadlocking, and transfers over other wallets are not blocked.
    /// The receiver is credited with a store-side `balance + amount`, so racing
    /// credits to one wallet cannot lose an update, even when the receiver is new.
    ///
    /// With a `deadline`, every statement in the transaction is also bounded by a
    /// server-side `statement_timeout`, so an abandoned call cannot leave a row locked.
    pub async fn prepare_transfer(
        &self,
        from: &str,
        to: &str,
        amount: &TokenAmount,
        deadline: Option<Duration>,
    ) -> Result<PreparedTransfer> {
        let now = Utc::now();

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        if let Some(limit) = deadline {
            sqlx::query("SELECT set_config('statement_timeout', $1, true)")
                .bind(limit.as_micros().div_ceil(1000).max(1).to_string())
                .execute(&mut *tx)
                .await
                .context("Failed to set statement timeout")?;
        }

        let locked = sqlx::query(
            r#"
            SELECT address, balance::text AS balance
            FROM wallets
            WHERE address = $1 OR address = $2
            ORDER BY address
            FOR UPDATE
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to lock wallets")?;

        let sender = locked
            .iter()
            .find(|row| row.get::<&str, _>("address") == from);
        let Some(sender) = sender else {
            tx.rollback().await.context("Failed to roll back transfer")?;
            return Ok(PreparedTransfer::SenderNotFound);
        };

        let balance = parse_stored_amount(sender.get("balance"))
            .context("Invalid sender balance")?;
        let Some(sender_balance) = balance.checked_sub(amount) else {
            tx.rollback().await.context("Failed to roll back transfer")?;
            return Ok(PreparedTransfer::InsufficientBalance { balance });
        };

        sqlx::query("UPDATE wallets SET balance = $1::numeric, updated_at = $2 WHERE address = $3")
            .bind(sender_balance.to_string())
            .bind(now)
            .bind(from)
            .execute(&mut *tx)
            .await
            .context("Failed to debit sender")?;

        sqlx::query(
            r#"
            INSERT INTO wallets (address, balance, created_at, updated_at)
            VALUES ($1, $2::numeric, $3, $3)
            ON CONFLICT (address) DO UPDATE
                SET balance = wallets.balance + EXCLUDED.balance,
                    updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(to)
        .bind(amount.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("Failed to credit receiver")?;

        let row = sqlx::query(
            r#"
            INSERT INTO transfers (from_address, to_address, amount, created_at)
            VALUES ($1, $2, $3::numeric, $4)
            RETURNING id, created_at
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(amount.to_string())
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to record transfer")?;

        Ok(PreparedTransfer::Staged(StagedTransfer {
            tx,
            record: TransferRecord {
                id: row.get("id"),
                from_address: from.to_string(),
                to_address: to.to_string(),
                amount: amount.clone(),
                created_at: row.get("created_at"),
            },
            sender_balance,
        }))
    }

    /// List transfers in id order, optionally keeping only the most recent `limit`.
    pub async fn list_transfers(&self, limit: Option<usize>) -> Result<Vec<TransferRecord>> {
        let rows = match limit {
            // Newest `lim` rows, flipped back to ascending order
            Some(lim) => {
                sqlx::query(
                    r#"
                    SELECT * FROM (
                        SELECT id, from_address, to_address, amount::text AS amount, created_at
                        FROM transfers
                        ORDER BY id DESC
                        LIMIT $1
                    ) recent
                    ORDER BY id
                    "#,
                )
                .bind(i64::try_from(lim).unwrap_or(i64::MAX))
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, from_address, to_address, amount::text AS amount, created_at
                    FROM transfers
                    ORDER BY id
                    "#,
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to list transfers")?;

        rows.iter().map(Self::row_to_transfer).collect()
    }

    /// List transfers for a specific wallet (as source or destination).
    pub async fn list_transfers_for_wallet(&self, address: &str) -> Result<Vec<TransferRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, from_address, to_address, amount::text AS amount, created_at
            FROM transfers
            WHERE from_address = $1 OR to_address = $1
            ORDER BY id
            "#,
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list transfers for wallet")?;

        rows.iter().map(Self::row_to_transfer).collect()
    }

    /// Get statistics for integrity checking.
    pub async fn get_integrity_stats(&self) -> Result<IntegrityStats> {
        let counts = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM wallets) AS wallet_count,
                (SELECT COUNT(*) FROM transfers) AS transfer_count
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to count rows")?;

        let invalid_wallet_refs: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS count
            FROM transfers t
            WHERE NOT EXISTS (SELECT 1 FROM wallets w WHERE w.address = t.from_address)
               OR NOT EXISTS (SELECT 1 FROM wallets w WHERE w.address = t.to_address)
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to check wallet references")?
        .get("count");

        let invalid_amounts: i64 = sqlx::query(
            "SELECT COUNT(*) AS count FROM transfers WHERE amount <= 0 OR scale(amount) <> 0",
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to check transfer amounts")?
        .get("count");

        let invalid_balances: i64 = sqlx::query(
            "SELECT COUNT(*) AS count FROM wallets WHERE balance < 0 OR scale(balance) <> 0",
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to check wallet balances")?
        .get("count");

        Ok(IntegrityStats {
            wallet_count: counts.get("wallet_count"),
            transfer_count: counts.get("transfer_count"),
            invalid_wallet_refs,
            invalid_amounts,
            invalid_balances,
        })
    }

    fn row_to_transfer(row: &PgRow) -> Result<TransferRecord> {
        Ok(TransferRecord {
            id: row.get("id"),
            from_address: row.get("from_address"),
            to_address: row.get("to_address"),
            amount: parse_stored_amount(row.get("amount"))?,
            created_at: row.get("created_at"),
        })
    }
}

/// Schema names are spliced into DDL, so only plain identifiers are accepted.
fn check_schema_name(schema: &str) -> Result<()> {
    let valid = !schema.is_empty()
        && schema
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        bail!("Invalid schema name: {:?}", schema);
    }
    Ok(())
}

fn parse_stored_amount(value: String) -> Result<TokenAmount> {
    value
        .parse()
        .with_context(|| format!("Invalid stored amount: {:?}", value))
}
