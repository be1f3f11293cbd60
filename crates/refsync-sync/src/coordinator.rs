//! Lock transitions over the singleton system-state record.
//!
//! Every transition is a load followed by a compare-and-swap on the row
//! version. Try-begin operations give up on the first mismatch; completions
//! reload and retry a bounded number of times so a concurrent
//! [`SystemStateCoordinator::mark_sync_now`] cannot leave a lock held.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use refsync_core::{StatusSnapshot, SystemState, SystemStateKind};
use refsync_storage::SystemStateStore;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::SyncError;

const COMPLETION_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Success,
    Failure(String),
}

#[derive(Debug, Clone, Copy)]
struct CachedStatus {
    loaded_at: Instant,
    snapshot: StatusSnapshot,
}

pub struct SystemStateCoordinator {
    store: Arc<dyn SystemStateStore>,
    ttl: Duration,
    cache: RwLock<Option<CachedStatus>>,
}

impl SystemStateCoordinator {
    pub fn new(store: Arc<dyn SystemStateStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: RwLock::new(None),
        }
    }

    /// Uncached read of the full record.
    pub async fn current_state(&self) -> Result<SystemState, SyncError> {
        Ok(self.store.load_system_state().await?)
    }

    pub async fn try_begin_bootstrap(&self) -> Result<bool, SyncError> {
        let current = self.store.load_system_state().await?;
        if current.bootstrap_in_progress || current.state == SystemStateKind::Ready {
            debug!(state = current.state.as_str(), "bootstrap not started");
            return Ok(false);
        }
        let next = SystemState {
            state: SystemStateKind::Initializing,
            bootstrap_in_progress: true,
            sync_in_progress: false,
            last_sync_error: None,
            updated_at: Utc::now(),
            ..current.clone()
        };
        self.try_transition("begin bootstrap", &current, &next).await
    }

    pub async fn complete_bootstrap(&self, completion: Completion) -> Result<(), SyncError> {
        self.complete("complete bootstrap", |state, now| {
            state.bootstrap_in_progress = false;
            apply_completion(state, &completion, now);
        })
        .await
    }

    pub async fn try_begin_nightly_sync(&self) -> Result<bool, SyncError> {
        let current = self.store.load_system_state().await?;
        if current.bootstrap_in_progress
            || current.sync_in_progress
            || current.state == SystemStateKind::Initializing
        {
            debug!(
                state = current.state.as_str(),
                bootstrap_in_progress = current.bootstrap_in_progress,
                sync_in_progress = current.sync_in_progress,
                "nightly sync not started"
            );
            return Ok(false);
        }
        let next = SystemState {
            sync_in_progress: true,
            last_sync_error: None,
            updated_at: Utc::now(),
            ..current.clone()
        };
        self.try_transition("begin nightly sync", &current, &next).await
    }

    pub async fn complete_nightly_sync(&self, completion: Completion) -> Result<(), SyncError> {
        self.complete("complete nightly sync", |state, now| {
            state.sync_in_progress = false;
            apply_completion(state, &completion, now);
        })
        .await
    }

    /// Cached for the configured TTL; any successful mutation made through
    /// this coordinator drops the cache.
    pub async fn get_status(&self) -> Result<StatusSnapshot, SyncError> {
        if let Some(cached) = *self.cache.read().await {
            if cached.loaded_at.elapsed() < self.ttl {
                return Ok(cached.snapshot);
            }
        }

        let snapshot = self.store.load_system_state().await?.status();
        *self.cache.write().await = Some(CachedStatus {
            loaded_at: Instant::now(),
            snapshot,
        });
        Ok(snapshot)
    }

    /// Refreshes `last_sync_at` without touching state or locks.
    pub async fn mark_sync_now(&self) -> Result<(), SyncError> {
        self.store.touch_last_sync(Utc::now()).await?;
        self.invalidate().await;
        Ok(())
    }

    async fn try_transition(
        &self,
        operation: &'static str,
        current: &SystemState,
        next: &SystemState,
    ) -> Result<bool, SyncError> {
        let acquired = self
            .store
            .compare_and_swap_system_state(current.version, next)
            .await?;
        if acquired {
            self.invalidate().await;
            info!(operation, "system state lock acquired");
        } else {
            info!(operation, "system state changed concurrently; lock not acquired");
        }
        Ok(acquired)
    }

    async fn complete<F>(&self, operation: &'static str, apply: F) -> Result<(), SyncError>
    where
        F: Fn(&mut SystemState, DateTime<Utc>) + Send + Sync,
    {
        for attempt in 1..=COMPLETION_ATTEMPTS {
            let current = self.store.load_system_state().await?;
            let now = Utc::now();
            let mut next = current.clone();
            apply(&mut next, now);
            next.updated_at = now;

            if self
                .store
                .compare_and_swap_system_state(current.version, &next)
                .await?
            {
                self.invalidate().await;
                info!(operation, state = next.state.as_str(), "system state updated");
                return Ok(());
            }
            warn!(operation, attempt, "system state changed concurrently; retrying");
        }
        Err(SyncError::StateContention {
            operation,
            attempts: COMPLETION_ATTEMPTS,
        })
    }

    async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}

fn apply_completion(state: &mut SystemState, completion: &Completion, now: DateTime<Utc>) {
    match completion {
        Completion::Success => {
            state.state = SystemStateKind::Ready;
            state.last_sync_at = Some(now);
            state.last_sync_error = None;
        }
        Completion::Failure(message) => {
            state.state = SystemStateKind::Degraded;
            state.last_sync_error = Some(message.clone());
        }
    }
}
