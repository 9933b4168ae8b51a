// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use coinledger::LedgerConfig;
use coinledger::application::{AggregationLoader, LedgerService};
use coinledger::domain::{Coins, LedgerScan, User};
use coinledger::storage::{LedgerStore, ScanIsolation, SqliteStore};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Merch ids as seeded by the initial migration
pub const T_SHIRT: i64 = 1;
pub const CUP: i64 = 2;
pub const PEN: i64 = 4;
pub const PINK_HOODY: i64 = 10;

/// Helper to create a test service with a temporary database
pub async fn test_service() -> Result<(LedgerService<SqliteStore>, TempDir)> {
    let temp_dir = TempDir::new()?;
    let config = test_config(&temp_dir);
    let service = LedgerService::<SqliteStore>::init(&config).await?;
    Ok((service, temp_dir))
}

pub fn test_config(temp_dir: &TempDir) -> LedgerConfig {
    let db_path = temp_dir.path().join("test.db");
    LedgerConfig::for_database_path(db_path.to_str().unwrap())
}

/// A token nobody cancels
pub fn live() -> CancellationToken {
    CancellationToken::new()
}

pub fn loader(service: &LedgerService<SqliteStore>) -> AggregationLoader<SqliteStore> {
    AggregationLoader::new(Arc::clone(service.store()))
}

pub async fn scan(service: &LedgerService<SqliteStore>) -> Result<LedgerScan> {
    Ok(service.store().scan_ledger(ScanIsolation::Snapshot).await?)
}

pub async fn total_balance(service: &LedgerService<SqliteStore>) -> Result<Coins> {
    Ok(scan(service).await?.users.iter().map(|u| u.balance).sum())
}

/// Test fixture: users with the given starting balances
pub async fn create_users(
    service: &LedgerService<SqliteStore>,
    balances: &[Coins],
) -> Result<Vec<User>> {
    let mut users = Vec::with_capacity(balances.len());
    for (index, balance) in balances.iter().enumerate() {
        let user = service
            .create_user(&live(), format!("user-{}", index), "secret", *balance)
            .await?;
        users.push(user);
    }
    Ok(users)
}
