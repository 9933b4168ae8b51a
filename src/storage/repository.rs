use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteExecutor, SqlitePool, Transaction};
use tokio_util::sync::CancellationToken;

use crate::application::{LedgerError, Result};
use crate::domain::{
    Coins, LedgerScan, Merch, MerchId, NewUser, Operation, Purchase, User, UserId, total_cost,
};

use super::{LedgerStore, MIGRATION_001_INITIAL, ScanIsolation};

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// SQLite-backed ledger store.
///
/// SQLite has no row-level `SELECT ... FOR UPDATE`. Balance mutations open
/// their transaction with `BEGIN IMMEDIATE`, which takes the database write
/// lock before the balance is read, so the check and the update cannot
/// interleave with another writer.
///
/// Transactions run on their own task and always end in an explicit commit
/// or rollback. Dropping the caller's future cancels the task, which then
/// rolls back before its connection returns to the pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new store over an existing connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `database_url`.
    /// WAL mode lets snapshot scans proceed while a transfer holds the write lock.
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {}", database_url))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        tracing::debug!(database_url, max_connections, "connected to ledger store");
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;
        Ok(())
    }

    /// Initialize a database (connect + migrate).
    pub async fn init(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let store = Self::connect(database_url, max_connections).await?;
        store.migrate().await?;
        Ok(store)
    }

    /// Wait for checked out connections and close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run `body` on a separate task that outlives the caller's future.
    ///
    /// If the caller is dropped first, the token handed to `body` fires.
    async fn detached<T, F, Fut>(&self, operation: &'static str, body: F) -> Result<T>
    where
        F: FnOnce(SqliteStore, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();
        tokio::spawn(body(self.clone(), cancel))
            .await
            .with_context(|| format!("Ledger task for {} failed", operation))?
    }

    /// Open a transaction holding the write lock from its first statement.
    async fn begin_locked(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .context("Failed to begin ledger transaction")?)
    }

    /// Commit on success, otherwise roll back and surface the error.
    async fn finish<T>(tx: Transaction<'static, Sqlite>, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                tx.commit()
                    .await
                    .context("Failed to commit ledger transaction")?;
                Ok(value)
            }
            Err(err) => Self::abort(tx, err).await,
        }
    }

    /// Read a balance inside a locked transaction.
    async fn locked_balance(tx: &mut Transaction<'_, Sqlite>, user_id: UserId) -> Result<Coins> {
        let row = sqlx::query(r#"SELECT balance FROM "user" WHERE user_id = ?"#)
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await
            .context("Failed to read balance")?;

        match row {
            Some(row) => Ok(row.try_get("balance").context("Invalid balance column")?),
            None => Err(LedgerError::UserNotFound(user_id)),
        }
    }

    async fn debit(tx: &mut Transaction<'_, Sqlite>, user_id: UserId, amount: Coins) -> Result<()> {
        sqlx::query(r#"UPDATE "user" SET balance = balance - ? WHERE user_id = ?"#)
            .bind(amount)
            .bind(user_id)
            .execute(&mut **tx)
            .await
            .context("Failed to debit balance")?;
        Ok(())
    }

    async fn credit(tx: &mut Transaction<'_, Sqlite>, user_id: UserId, amount: Coins) -> Result<()> {
        sqlx::query(r#"UPDATE "user" SET balance = balance + ? WHERE user_id = ?"#)
            .bind(amount)
            .bind(user_id)
            .execute(&mut **tx)
            .await
            .context("Failed to credit balance")?;
        Ok(())
    }

    /// Roll back explicitly and surface the rejection.
    async fn abort<T>(tx: Transaction<'_, Sqlite>, err: LedgerError) -> Result<T> {
        if matches!(err, LedgerError::Canceled) {
            tracing::debug!("ledger transaction canceled, rolling back");
        }
        tx.rollback()
            .await
            .context("Failed to roll back ledger transaction")?;
        Err(err)
    }

    /// Check, debit, credit and record a transfer inside `tx`.
    async fn apply_transfer(
        tx: &mut Transaction<'_, Sqlite>,
        from_user: UserId,
        to_user: UserId,
        amount: Coins,
    ) -> Result<Operation> {
        let balance = Self::locked_balance(tx, from_user).await?;
        if balance < amount {
            return Err(LedgerError::InsufficientFunds {
                user_id: from_user,
                balance,
                required: amount,
            });
        }

        // SQLite would silently store an overflowing sum as REAL
        let receiver_balance = Self::locked_balance(tx, to_user).await?;
        if receiver_balance.checked_add(amount).is_none() {
            return Err(LedgerError::InvalidAmount(format!(
                "crediting {} coins overflows the balance of user {}",
                amount, to_user
            )));
        }

        Self::debit(tx, from_user, amount).await?;
        Self::credit(tx, to_user, amount).await?;

        let row = sqlx::query(
            r#"
            INSERT INTO operation (from_user, to_user, amount)
            VALUES (?, ?, ?)
            RETURNING operation_id
            "#,
        )
        .bind(from_user)
        .bind(to_user)
        .bind(amount)
        .fetch_one(&mut **tx)
        .await
        .context("Failed to record operation")?;

        Ok(Operation {
            operation_id: row.try_get("operation_id").context("Invalid operation_id")?,
            from_user,
            to_user,
            amount,
        })
    }

    /// Price, check, debit and record a purchase inside `tx`.
    async fn apply_purchase(
        tx: &mut Transaction<'_, Sqlite>,
        user_id: UserId,
        merch_id: MerchId,
        count: i64,
    ) -> Result<Purchase> {
        let price_row = sqlx::query("SELECT price FROM merch WHERE merch_id = ?")
            .bind(merch_id)
            .fetch_optional(&mut **tx)
            .await
            .context("Failed to read merch price")?;
        let price: Coins = match price_row {
            Some(row) => row.try_get("price").context("Invalid price column")?,
            None => return Err(LedgerError::MerchNotFound(merch_id)),
        };

        let total = total_cost(price, count)
            .ok_or_else(|| LedgerError::InvalidAmount(format!("{} x {} overflows", price, count)))?;

        let balance = Self::locked_balance(tx, user_id).await?;
        if balance < total {
            return Err(LedgerError::InsufficientFunds {
                user_id,
                balance,
                required: total,
            });
        }

        Self::debit(tx, user_id, total).await?;

        let row = sqlx::query(
            r#"
            INSERT INTO purchase (user_id, merch_id, amount)
            VALUES (?, ?, ?)
            RETURNING purchase_id
            "#,
        )
        .bind(user_id)
        .bind(merch_id)
        .bind(count)
        .fetch_one(&mut **tx)
        .await
        .context("Failed to record purchase")?;

        Ok(Purchase {
            purchase_id: row.try_get("purchase_id").context("Invalid purchase_id")?,
            user_id,
            merch_id,
            amount: count,
        })
    }

    async fn scan_users<'e>(executor: impl SqliteExecutor<'e>) -> Result<Vec<User>> {
        let rows = sqlx::query(
            r#"SELECT user_id, name, password, balance FROM "user" ORDER BY user_id"#,
        )
        .fetch_all(executor)
        .await
        .context("Failed to scan users")?;

        Ok(rows
            .iter()
            .map(Self::row_to_user)
            .collect::<anyhow::Result<_>>()?)
    }

    async fn scan_operations<'e>(executor: impl SqliteExecutor<'e>) -> Result<Vec<Operation>> {
        let rows = sqlx::query(
            "SELECT operation_id, from_user, to_user, amount FROM operation ORDER BY operation_id",
        )
        .fetch_all(executor)
        .await
        .context("Failed to scan operations")?;

        Ok(rows
            .iter()
            .map(Self::row_to_operation)
            .collect::<anyhow::Result<_>>()?)
    }

    async fn scan_purchases<'e>(executor: impl SqliteExecutor<'e>) -> Result<Vec<Purchase>> {
        let rows = sqlx::query(
            "SELECT purchase_id, user_id, merch_id, amount FROM purchase ORDER BY purchase_id",
        )
        .fetch_all(executor)
        .await
        .context("Failed to scan purchases")?;

        Ok(rows
            .iter()
            .map(Self::row_to_purchase)
            .collect::<anyhow::Result<_>>()?)
    }

    async fn scan_all(tx: &mut Transaction<'_, Sqlite>) -> Result<LedgerScan> {
        Ok(LedgerScan {
            users: Self::scan_users(&mut **tx).await?,
            operations: Self::scan_operations(&mut **tx).await?,
            purchases: Self::scan_purchases(&mut **tx).await?,
        })
    }

    fn row_to_user(row: &SqliteRow) -> anyhow::Result<User> {
        Ok(User {
            user_id: row.try_get("user_id")?,
            name: row.try_get("name")?,
            password: row.try_get("password")?,
            balance: row.try_get("balance")?,
        })
    }

    fn row_to_merch(row: &SqliteRow) -> anyhow::Result<Merch> {
        Ok(Merch {
            merch_id: row.try_get("merch_id")?,
            merch_type: row.try_get("type")?,
            price: row.try_get("price")?,
        })
    }

    fn row_to_operation(row: &SqliteRow) -> anyhow::Result<Operation> {
        Ok(Operation {
            operation_id: row.try_get("operation_id")?,
            from_user: row.try_get("from_user")?,
            to_user: row.try_get("to_user")?,
            amount: row.try_get("amount")?,
        })
    }

    fn row_to_purchase(row: &SqliteRow) -> anyhow::Result<Purchase> {
        Ok(Purchase {
            purchase_id: row.try_get("purchase_id")?,
            user_id: row.try_get("user_id")?,
            merch_id: row.try_get("merch_id")?,
            amount: row.try_get("amount")?,
        })
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn create_user(&self, new_user: NewUser) -> Result<User> {
        let row = sqlx::query(
            r#"
            INSERT INTO "user" (name, password, balance)
            VALUES (?, ?, ?)
            RETURNING user_id
            "#,
        )
        .bind(&new_user.name)
        .bind(&new_user.password)
        .bind(new_user.balance)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create user")?;

        let user_id: UserId = row.try_get("user_id").context("Invalid user_id column")?;
        Ok(new_user.into_user(user_id))
    }

    async fn get_user(&self, user_id: UserId) -> Result<User> {
        let row = sqlx::query(
            r#"SELECT user_id, name, password, balance FROM "user" WHERE user_id = ?"#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user")?;

        match row {
            Some(row) => Ok(Self::row_to_user(&row)?),
            None => Err(LedgerError::UserNotFound(user_id)),
        }
    }

    async fn transfer(
        &self,
        from_user: UserId,
        to_user: UserId,
        amount: Coins,
    ) -> Result<Operation> {
        self.detached("transfer", move |store, cancel| async move {
            let mut tx = store.begin_locked().await?;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(LedgerError::Canceled),
                outcome = Self::apply_transfer(&mut tx, from_user, to_user, amount) => outcome,
            };
            Self::finish(tx, outcome).await
        })
        .await
    }

    async fn purchase_merch(
        &self,
        user_id: UserId,
        merch_id: MerchId,
        count: i64,
    ) -> Result<Purchase> {
        self.detached("purchase_merch", move |store, cancel| async move {
            let mut tx = store.begin_locked().await?;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(LedgerError::Canceled),
                outcome = Self::apply_purchase(&mut tx, user_id, merch_id, count) => outcome,
            };
            Self::finish(tx, outcome).await
        })
        .await
    }

    async fn get_merch(&self, merch_id: MerchId) -> Result<Merch> {
        let row = sqlx::query("SELECT merch_id, type, price FROM merch WHERE merch_id = ?")
            .bind(merch_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch merch")?;

        match row {
            Some(row) => Ok(Self::row_to_merch(&row)?),
            None => Err(LedgerError::MerchNotFound(merch_id)),
        }
    }

    async fn list_merch(&self) -> Result<Vec<Merch>> {
        let rows = sqlx::query("SELECT merch_id, type, price FROM merch ORDER BY merch_id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list merch")?;

        Ok(rows
            .iter()
            .map(Self::row_to_merch)
            .collect::<anyhow::Result<_>>()?)
    }

    async fn scan_ledger(&self, isolation: ScanIsolation) -> Result<LedgerScan> {
        match isolation {
            ScanIsolation::Independent => Ok(LedgerScan {
                users: Self::scan_users(&self.pool).await?,
                operations: Self::scan_operations(&self.pool).await?,
                purchases: Self::scan_purchases(&self.pool).await?,
            }),
            // Under WAL a deferred transaction reads one snapshot for all
            // three queries without blocking writers.
            ScanIsolation::Snapshot => {
                self.detached("scan_ledger", |store, cancel| async move {
                    let mut tx = store
                        .pool
                        .begin()
                        .await
                        .context("Failed to begin snapshot scan")?;
                    let outcome = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(LedgerError::Canceled),
                        outcome = Self::scan_all(&mut tx) => outcome,
                    };
                    Self::finish(tx, outcome).await
                })
                .await
            }
        }
    }
}
