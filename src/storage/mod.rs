mod memory;
mod repository;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::*;
pub use repository::*;

use crate::application::Result;
use crate::domain::{
    Coins, LedgerScan, Merch, MerchId, NewUser, Operation, Purchase, User, UserId,
};

/// SQL migration for the initial schema and merch catalogue
pub const MIGRATION_001_INITIAL: &str = include_str!("migrations/001_initial.sql");

/// How the three snapshot scans relate to each other in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanIsolation {
    /// Three independent queries. A transfer committing between them may show
    /// up in one scan and not another.
    #[default]
    Independent,
    /// All three queries read from one transaction, i.e. one point in time.
    Snapshot,
}

/// Storage capability behind the ledger and the snapshot loader.
///
/// Balance mutations must check and update the balance inside one locked
/// transaction, so that no two concurrent mutations of the same user pass the
/// check against a stale balance. Any error leaves the store unchanged.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a user and return it with the assigned identifier.
    async fn create_user(&self, new_user: NewUser) -> Result<User>;

    /// Strongly consistent point read.
    async fn get_user(&self, user_id: UserId) -> Result<User>;

    /// Move `amount` coins from one user to another and record the operation.
    async fn transfer(
        &self,
        from_user: UserId,
        to_user: UserId,
        amount: Coins,
    ) -> Result<Operation>;

    /// Charge `price * count` coins and record the purchase.
    async fn purchase_merch(
        &self,
        user_id: UserId,
        merch_id: MerchId,
        count: i64,
    ) -> Result<Purchase>;

    async fn get_merch(&self, merch_id: MerchId) -> Result<Merch>;

    async fn list_merch(&self) -> Result<Vec<Merch>>;

    /// Full scans of users, operations and purchases.
    async fn scan_ledger(&self, isolation: ScanIsolation) -> Result<LedgerScan>;
}
