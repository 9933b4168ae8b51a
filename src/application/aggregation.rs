use std::collections::HashMap;
use std::sync::Arc;

use crate::config::LedgerConfig;
use crate::domain::{UserId, UserInfo, join_user_infos};
use crate::storage::{LedgerStore, ScanIsolation};

use super::{LedgerError, Result};

/// Builds the full set of [`UserInfo`] records for the snapshot cache.
///
/// Users, operations and purchases are read as three full scans and joined
/// in memory. With [`ScanIsolation::Independent`] the scans may observe
/// different points in time; history rows that reference a user absent from
/// the user scan are dropped for that side.
pub struct AggregationLoader<S> {
    store: Arc<S>,
    isolation: ScanIsolation,
    max_users: Option<usize>,
}

impl<S: LedgerStore> AggregationLoader<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            isolation: ScanIsolation::default(),
            max_users: None,
        }
    }

    pub fn from_config(store: Arc<S>, config: &LedgerConfig) -> Self {
        Self::new(store)
            .with_isolation(config.scan_isolation)
            .with_max_users(config.max_snapshot_users)
    }

    pub fn with_isolation(mut self, isolation: ScanIsolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Fail the load instead of building a snapshot with more users than this.
    pub fn with_max_users(mut self, max_users: Option<usize>) -> Self {
        self.max_users = max_users;
        self
    }

    pub fn isolation(&self) -> ScanIsolation {
        self.isolation
    }

    pub async fn load(&self) -> Result<HashMap<UserId, UserInfo>> {
        let scan = self.store.scan_ledger(self.isolation).await?;

        if let Some(max_users) = self.max_users {
            if scan.users.len() > max_users {
                return Err(LedgerError::Store(anyhow::anyhow!(
                    "snapshot of {} users exceeds the budget of {}",
                    scan.users.len(),
                    max_users
                )));
            }
        }

        tracing::debug!(
            users = scan.users.len(),
            operations = scan.operations.len(),
            purchases = scan.purchases.len(),
            isolation = ?self.isolation,
            "ledger scanned"
        );
        Ok(join_user_infos(scan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewUser;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_load_joins_history() {
        let store = Arc::new(MemoryStore::with_merch([("cup", 20)]));
        let a = store.create_user(NewUser::new("a", "p", 500)).await.unwrap();
        let b = store.create_user(NewUser::new("b", "p", 100)).await.unwrap();
        store.transfer(a.user_id, b.user_id, 300).await.unwrap();
        store.purchase_merch(b.user_id, 1, 2).await.unwrap();

        let infos = AggregationLoader::new(store).load().await.unwrap();

        assert_eq!(infos.len(), 2);
        assert_eq!(infos[&a.user_id].user.balance, 200);
        assert_eq!(infos[&a.user_id].operations.len(), 1);
        assert!(infos[&a.user_id].purchases.is_empty());
        assert_eq!(infos[&b.user_id].user.balance, 360);
        assert_eq!(infos[&b.user_id].operations.len(), 1);
        assert_eq!(infos[&b.user_id].purchases.len(), 1);
    }

    #[tokio::test]
    async fn test_load_respects_user_budget() {
        let store = Arc::new(MemoryStore::new());
        for name in ["a", "b", "c"] {
            store.create_user(NewUser::new(name, "p", 0)).await.unwrap();
        }

        let loader = AggregationLoader::new(Arc::clone(&store)).with_max_users(Some(2));
        assert!(matches!(loader.load().await, Err(LedgerError::Store(_))));

        let loader = AggregationLoader::new(store).with_max_users(Some(3));
        assert_eq!(loader.load().await.unwrap().len(), 3);
    }
}
