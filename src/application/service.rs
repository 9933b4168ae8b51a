use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::LedgerConfig;
use crate::domain::{
    Coins, Merch, MerchId, NewUser, Operation, Purchase, User, UserId, is_positive_amount,
};
use crate::storage::{LedgerStore, SqliteStore};

use super::{LedgerError, Result};

/// Application service providing the ledger operations.
/// This is the write path and the strongly consistent read path for any
/// client; lookups that tolerate staleness go through [`super::SnapshotCache`].
///
/// Every operation races the caller's cancellation token and the configured
/// deadline. Losing that race drops the in-flight store call, which rolls
/// back any open transaction, and yields [`LedgerError::Canceled`].
pub struct LedgerService<S> {
    store: Arc<S>,
    operation_timeout: Duration,
}

impl<S> Clone for LedgerService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            operation_timeout: self.operation_timeout,
        }
    }
}

impl LedgerService<SqliteStore> {
    /// Connect to the configured database and apply the schema.
    pub async fn init(config: &LedgerConfig) -> Result<Self> {
        let store = SqliteStore::init(&config.database_url, config.max_connections).await?;
        Ok(Self::new(Arc::new(store), config.operation_timeout()))
    }

    /// Connect to an already initialized database.
    pub async fn connect(config: &LedgerConfig) -> Result<Self> {
        let store = SqliteStore::connect(&config.database_url, config.max_connections).await?;
        Ok(Self::new(Arc::new(store), config.operation_timeout()))
    }
}

impl<S: LedgerStore> LedgerService<S> {
    pub fn new(store: Arc<S>, operation_timeout: Duration) -> Self {
        Self {
            store,
            operation_timeout,
        }
    }

    /// The shared store handle, e.g. for building an [`super::AggregationLoader`].
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // ========================
    // User operations
    // ========================

    /// Create a user with an initial balance.
    pub async fn create_user(
        &self,
        cancel: &CancellationToken,
        name: impl Into<String>,
        password: impl Into<String>,
        balance: Coins,
    ) -> Result<User> {
        let new_user = NewUser::new(name, password, balance);
        let user = self
            .guarded(cancel, "create_user", self.store.create_user(new_user))
            .await?;
        tracing::info!(user_id = user.user_id, balance, "user created");
        Ok(user)
    }

    /// Read a user straight from the store, bypassing the snapshot cache.
    pub async fn get_user(&self, cancel: &CancellationToken, user_id: UserId) -> Result<User> {
        self.guarded(cancel, "get_user", self.store.get_user(user_id))
            .await
    }

    // ========================
    // Balance mutations
    // ========================

    /// Move coins between two users and record the operation.
    pub async fn transfer(
        &self,
        cancel: &CancellationToken,
        from_user: UserId,
        to_user: UserId,
        amount: Coins,
    ) -> Result<Operation> {
        if !is_positive_amount(amount) {
            return Err(LedgerError::InvalidAmount(format!(
                "transfer amount must be positive, got {}",
                amount
            )));
        }
        if from_user == to_user {
            return Err(LedgerError::SelfTransfer(from_user));
        }

        tracing::debug!(from_user, to_user, amount, "transfer requested");
        let result = self
            .guarded(
                cancel,
                "transfer",
                self.store.transfer(from_user, to_user, amount),
            )
            .await;

        match &result {
            Ok(operation) => tracing::info!(
                operation_id = operation.operation_id,
                from_user,
                to_user,
                amount,
                "transfer committed"
            ),
            Err(err) => tracing::warn!(from_user, to_user, amount, error = %err, "transfer rejected"),
        }
        result
    }

    /// Buy `count` items of a merch, charging `price * count` coins.
    pub async fn purchase_merch(
        &self,
        cancel: &CancellationToken,
        user_id: UserId,
        merch_id: MerchId,
        count: i64,
    ) -> Result<Purchase> {
        if !is_positive_amount(count) {
            return Err(LedgerError::InvalidAmount(format!(
                "purchase count must be positive, got {}",
                count
            )));
        }

        tracing::debug!(user_id, merch_id, count, "purchase requested");
        let result = self
            .guarded(
                cancel,
                "purchase_merch",
                self.store.purchase_merch(user_id, merch_id, count),
            )
            .await;

        match &result {
            Ok(purchase) => tracing::info!(
                purchase_id = purchase.purchase_id,
                user_id,
                merch_id,
                count,
                "purchase committed"
            ),
            Err(err) => tracing::warn!(user_id, merch_id, count, error = %err, "purchase rejected"),
        }
        result
    }

    // ========================
    // Merch catalogue
    // ========================

    pub async fn get_merch(&self, cancel: &CancellationToken, merch_id: MerchId) -> Result<Merch> {
        self.guarded(cancel, "get_merch", self.store.get_merch(merch_id))
            .await
    }

    pub async fn list_merch(&self, cancel: &CancellationToken) -> Result<Vec<Merch>> {
        self.guarded(cancel, "list_merch", self.store.list_merch())
            .await
    }

    /// Run a store call until it finishes, the caller cancels, or the
    /// operation deadline passes, whichever comes first.
    async fn guarded<T>(
        &self,
        cancel: &CancellationToken,
        operation: &'static str,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        if cancel.is_cancelled() {
            return Err(LedgerError::Canceled);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(operation, "canceled by caller");
                Err(LedgerError::Canceled)
            }
            outcome = tokio::time::timeout(self.operation_timeout, work) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        operation,
                        timeout_ms = self.operation_timeout.as_millis() as u64,
                        "deadline exceeded"
                    );
                    Err(LedgerError::Canceled)
                }
            },
        }
    }
}
