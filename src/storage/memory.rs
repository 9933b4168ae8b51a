use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::application::{LedgerError, Result};
use crate::domain::{
    Coins, LedgerScan, Merch, MerchId, NewUser, Operation, Purchase, User, UserId, total_cost,
};

use super::{LedgerStore, ScanIsolation};

#[derive(Default)]
struct Tables {
    users: BTreeMap<UserId, User>,
    merch: BTreeMap<MerchId, Merch>,
    operations: Vec<Operation>,
    purchases: Vec<Purchase>,
    next_user_id: UserId,
    next_operation_id: i64,
    next_purchase_id: i64,
}

/// In-process ledger store used as a test double.
///
/// All tables sit behind one mutex, so every mutation is serialized and
/// applied without suspension. Latency is injected before the lock is taken:
/// a caller dropped while waiting never changes any table. The availability
/// switch makes every call fail with a store error.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the merch catalogue. Identifiers are assigned in order from 1.
    pub fn with_merch<'a>(items: impl IntoIterator<Item = (&'a str, Coins)>) -> Self {
        let store = Self::new();
        {
            let mut tables = store.tables.lock();
            for (index, (merch_type, price)) in items.into_iter().enumerate() {
                let merch_id = index as MerchId + 1;
                tables.merch.insert(
                    merch_id,
                    Merch {
                        merch_id,
                        merch_type: merch_type.to_string(),
                        price,
                    },
                );
            }
        }
        store
    }

    /// Simulate losing (or regaining) the connection to the store.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Delay every call by `latency` before it touches any table.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    async fn enter(&self) -> Result<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("memory store is unavailable").into());
        }
        Ok(())
    }

    fn check_funds(user: &User, required: Coins) -> Result<()> {
        if user.balance < required {
            return Err(LedgerError::InsufficientFunds {
                user_id: user.user_id,
                balance: user.balance,
                required,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn create_user(&self, new_user: NewUser) -> Result<User> {
        self.enter().await?;
        let mut tables = self.tables.lock();
        tables.next_user_id += 1;
        let user = new_user.into_user(tables.next_user_id);
        tables.users.insert(user.user_id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, user_id: UserId) -> Result<User> {
        self.enter().await?;
        self.tables
            .lock()
            .users
            .get(&user_id)
            .cloned()
            .ok_or(LedgerError::UserNotFound(user_id))
    }

    async fn transfer(
        &self,
        from_user: UserId,
        to_user: UserId,
        amount: Coins,
    ) -> Result<Operation> {
        self.enter().await?;
        let mut tables = self.tables.lock();

        let sender = tables
            .users
            .get(&from_user)
            .ok_or(LedgerError::UserNotFound(from_user))?;
        Self::check_funds(sender, amount)?;
        let receiver = tables
            .users
            .get(&to_user)
            .ok_or(LedgerError::UserNotFound(to_user))?;
        let credited = receiver.balance.checked_add(amount).ok_or_else(|| {
            LedgerError::InvalidAmount(format!(
                "crediting {} coins overflows the balance of user {}",
                amount, to_user
            ))
        })?;

        // Both users exist, nothing below can fail
        if let Some(sender) = tables.users.get_mut(&from_user) {
            sender.balance -= amount;
        }
        if let Some(receiver) = tables.users.get_mut(&to_user) {
            receiver.balance = credited;
        }
        tables.next_operation_id += 1;
        let operation = Operation {
            operation_id: tables.next_operation_id,
            from_user,
            to_user,
            amount,
        };
        tables.operations.push(operation.clone());
        Ok(operation)
    }

    async fn purchase_merch(
        &self,
        user_id: UserId,
        merch_id: MerchId,
        count: i64,
    ) -> Result<Purchase> {
        self.enter().await?;
        let mut tables = self.tables.lock();

        let price = tables
            .merch
            .get(&merch_id)
            .map(|merch| merch.price)
            .ok_or(LedgerError::MerchNotFound(merch_id))?;
        let total = total_cost(price, count)
            .ok_or_else(|| LedgerError::InvalidAmount(format!("{} x {} overflows", price, count)))?;

        let buyer = tables
            .users
            .get_mut(&user_id)
            .ok_or(LedgerError::UserNotFound(user_id))?;
        Self::check_funds(buyer, total)?;
        buyer.balance -= total;

        tables.next_purchase_id += 1;
        let purchase = Purchase {
            purchase_id: tables.next_purchase_id,
            user_id,
            merch_id,
            amount: count,
        };
        tables.purchases.push(purchase.clone());
        Ok(purchase)
    }

    async fn get_merch(&self, merch_id: MerchId) -> Result<Merch> {
        self.enter().await?;
        self.tables
            .lock()
            .merch
            .get(&merch_id)
            .cloned()
            .ok_or(LedgerError::MerchNotFound(merch_id))
    }

    async fn list_merch(&self) -> Result<Vec<Merch>> {
        self.enter().await?;
        Ok(self.tables.lock().merch.values().cloned().collect())
    }

    async fn scan_ledger(&self, _isolation: ScanIsolation) -> Result<LedgerScan> {
        // Every scan is taken under the same lock, i.e. always snapshot-consistent
        self.enter().await?;
        let tables = self.tables.lock();
        Ok(LedgerScan {
            users: tables.users.values().cloned().collect(),
            operations: tables.operations.clone(),
            purchases: tables.purchases.clone(),
        })
    }
}
