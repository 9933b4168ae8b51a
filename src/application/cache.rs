use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::domain::{UserId, UserInfo};
use crate::storage::LedgerStore;

use super::{AggregationLoader, Result};

/// An immutable, point-in-time view of every user with their history.
#[derive(Debug, Default)]
pub struct Snapshot {
    users: HashMap<UserId, UserInfo>,
    built_at: Option<DateTime<Utc>>,
    generation: u64,
}

impl Snapshot {
    pub fn get(&self, user_id: UserId) -> Option<&UserInfo> {
        self.users.get(&user_id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// When the snapshot was installed. `None` until the first refresh.
    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }

    /// Number of successful refreshes that led to this snapshot.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// All user infos ordered by user id.
    pub fn user_infos(&self) -> Vec<&UserInfo> {
        let mut infos: Vec<&UserInfo> = self.users.values().collect();
        infos.sort_by_key(|info| info.user_id());
        infos
    }
}

/// Eventually consistent, read-only projection of the ledger.
///
/// Readers clone the current `Arc<Snapshot>` under a short read lock. The
/// refresher builds a complete replacement off to the side and swaps the
/// pointer, so a reader never sees a half-built snapshot. A failed refresh
/// leaves the previous snapshot in place.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    current: RwLock<Arc<Snapshot>>,
}

impl SnapshotCache {
    /// An empty cache. Every lookup misses until the first refresh succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a user in the last successfully built snapshot.
    pub fn get(&self, user_id: UserId) -> Option<UserInfo> {
        self.snapshot().get(user_id).cloned()
    }

    /// The snapshot currently being served.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Run one refresh cycle: load everything, then swap it in.
    /// On error the served snapshot is untouched.
    pub async fn refresh<S: LedgerStore>(
        &self,
        loader: &AggregationLoader<S>,
    ) -> Result<Arc<Snapshot>> {
        let users = loader.load().await?;
        Ok(self.install(users))
    }

    fn install(&self, users: HashMap<UserId, UserInfo>) -> Arc<Snapshot> {
        let mut current = self.current.write();
        let next = Arc::new(Snapshot {
            users,
            built_at: Some(Utc::now()),
            generation: current.generation + 1,
        });
        *current = Arc::clone(&next);
        next
    }

    /// Refresh immediately and then once per `interval` until `cancel` fires.
    ///
    /// A cancellation that lands mid-load discards the partial result.
    pub fn spawn_refresher<S>(
        self: &Arc<Self>,
        loader: AggregationLoader<S>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        S: LedgerStore + 'static,
    {
        let cache = Arc::clone(self);
        // tokio panics on a zero period
        let interval = interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                interval_ms = interval.as_millis() as u64,
                isolation = ?loader.isolation(),
                "snapshot refresher started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let started = Instant::now();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    outcome = cache.refresh(&loader) => match outcome {
                        Ok(snapshot) => tracing::info!(
                            generation = snapshot.generation(),
                            users = snapshot.len(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "snapshot refreshed"
                        ),
                        Err(err) => tracing::warn!(
                            error = %err,
                            generation = cache.snapshot().generation(),
                            "snapshot refresh failed, keeping previous snapshot"
                        ),
                    },
                }
            }

            tracing::info!("snapshot refresher stopped");
        })
    }
}
