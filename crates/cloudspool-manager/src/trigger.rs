// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Refresh trigger coordination.
//
// The periodic timer and the push channel both feed one pending-refresh slot.
// A request that arrives while a refresh is already pending is folded into
// it, so any number of requests during a running cycle produce exactly one
// follow-up cycle.  A single consumer drains the slot with `next_refresh`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use cloudspool_bridge::{PushChannel, PushEvent};

/// Why a refresh was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RefreshReason {
    Startup,
    Timer,
    Push,
    Manual,
}

/// Counters exposed through the manager snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TriggerStats {
    /// Requests received from any source.
    pub requested: u64,
    /// Requests folded into an already pending refresh.
    pub coalesced: u64,
    /// Refreshes handed to the consumer.
    pub delivered: u64,
}

/// Coalescing refresh queue with a capacity of one.
pub struct TriggerCoordinator {
    pending: Mutex<Option<BTreeSet<RefreshReason>>>,
    notify: Notify,
    requested: AtomicU64,
    coalesced: AtomicU64,
    delivered: AtomicU64,
}

impl Default for TriggerCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerCoordinator {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(None),
            notify: Notify::new(),
            requested: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    /// Ask for a refresh.  Safe to call from any task.
    pub fn request_refresh(&self, reason: RefreshReason) {
        self.requested.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        match pending.as_mut() {
            Some(reasons) => {
                reasons.insert(reason);
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                trace!(?reason, "refresh already pending, coalesced");
            }
            None => {
                *pending = Some(BTreeSet::from([reason]));
                // Stores a permit if the consumer is not waiting yet.
                self.notify.notify_one();
            }
        }
    }

    /// Wait until a refresh is due and take it.
    ///
    /// Returns the reasons folded into this refresh, or `None` once
    /// `shutdown` is cancelled.
    pub async fn next_refresh(
        &self,
        shutdown: &CancellationToken,
    ) -> Option<BTreeSet<RefreshReason>> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            if let Some(reasons) = self.take_pending() {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                return Some(reasons);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    fn take_pending(&self) -> Option<BTreeSet<RefreshReason>> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn stats(&self) -> TriggerStats {
        TriggerStats {
            requested: self.requested.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }

    /// Request a refresh every `period`, starting one period from now.
    pub fn spawn_timer(
        self: &Arc<Self>,
        period: Duration,
        tracker: &TaskTracker,
        shutdown: CancellationToken,
    ) {
        let trigger = Arc::clone(self);
        tracker.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => trigger.request_refresh(RefreshReason::Timer),
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!("refresh timer stopped");
        });
    }

    /// Forward push channel refresh events.
    ///
    /// A closed channel is not an error; the timer keeps things moving.
    pub fn spawn_push_listener(
        self: &Arc<Self>,
        push: Arc<dyn PushChannel>,
        tracker: &TaskTracker,
        shutdown: CancellationToken,
    ) {
        let trigger = Arc::clone(self);
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    event = push.next_event() => match event {
                        Some(PushEvent::Refresh) => trigger.request_refresh(RefreshReason::Push),
                        Some(PushEvent::Ping) => trace!("push ping"),
                        None => {
                            info!("push channel closed, relying on the refresh timer");
                            break;
                        }
                    },
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }
}
