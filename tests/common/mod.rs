// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use uuid::Uuid;
use wallet_ledger::application::LedgerService;
use wallet_ledger::storage::StoreOptions;

/// Addresses used throughout the tests.
pub const SEED: &str = "0x0000000000000000000000000000000000000000";
pub const ALICE: &str = "0x0000000000000000000000000000000000000001";
pub const BOB: &str = "0x0000000000000000000000000000000000000002";
pub const CAROL: &str = "0x0000000000000000000000000000000000000003";
pub const DAVE: &str = "0x0000000000000000000000000000000000000004";

/// A private schema in the database named by `DATABASE_URL`.
/// Every test gets its own, so tests can run in parallel against one server.
pub struct TestStore {
    pub url: String,
    pub options: StoreOptions,
}

impl TestStore {
    /// `None` when `DATABASE_URL` is not set; such tests return early.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let options = StoreOptions {
            max_connections: 20,
            schema: Some(format!("ledger_test_{}", Uuid::new_v4().simple())),
            ..StoreOptions::default()
        };
        Some(Self { url, options })
    }

    /// Migrate the schema and seed it
    pub async fn service(&self) -> Result<LedgerService> {
        Ok(LedgerService::init_with(&self.url, &self.options).await?)
    }

    /// A pool outside the service, for holding locks and writing raw rows
    pub async fn raw_pool(&self) -> Result<PgPool> {
        let mut options = PgConnectOptions::from_str(&self.url)?;
        if let Some(schema) = &self.options.schema {
            options = options.options([("search_path", schema.as_str())]);
        }
        Ok(PgPoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?)
    }
}

/// Helper to create a test service with a fresh, seeded schema
pub async fn test_service() -> Result<Option<(LedgerService, TestStore)>> {
    let Some(store) = TestStore::from_env() else {
        eprintln!("DATABASE_URL not set, skipping");
        return Ok(None);
    };
    let service = store.service().await?;
    Ok(Some((service, store)))
}

/// Same as `test_service`, shareable across spawned tasks
pub async fn shared_service() -> Result<Option<(Arc<LedgerService>, TestStore)>> {
    Ok(test_service()
        .await?
        .map(|(service, store)| (Arc::new(service), store)))
}

/// Current balance as a decimal string
pub async fn balance_of(service: &LedgerService, address: &str) -> Result<String> {
    Ok(service.get_balance(address).await?.to_string())
}

/// Test fixture: the wallets most tests start from
pub struct StandardWallets;

impl StandardWallets {
    /// Seed at 1,000,000 plus Alice, Bob and Carol at zero
    pub async fn create_basic(service: &LedgerService) -> Result<()> {
        for address in [ALICE, BOB, CAROL] {
            service.set_wallet(address, "0").await?;
        }
        Ok(())
    }
}
