//! Registry of blocked subscribers.
//!
//! A [`Waiter`] is resolved exactly once, by whichever of event delivery,
//! deadline expiry or cancellation claims it first. Claiming takes the
//! waiter's response sender, so a claimed waiter still present in some
//! category set is inert and is skipped by every other resolver until it
//! is detached.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use super::store::{Cursor, Event};

/// Identifier of a waiter, unique per broker.
pub type WaiterId = u64;

/// Errors from registry operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("waiter {0} is already registered")]
    AlreadyRegistered(WaiterId),

    #[error("waiter {0} has already been resolved")]
    NotPending(WaiterId),
}

/// Terminal outcome of a waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Matching events were handed over.
    Delivered(Vec<Arc<Event>>),
    /// The deadline passed with nothing to deliver.
    TimedOut,
    /// The caller went away or the broker shut down.
    Cancelled,
}

/// One blocked subscription request.
pub struct Waiter {
    id: WaiterId,
    categories: BTreeSet<String>,
    cursor: Cursor,
    arrival: Instant,
    deadline: Instant,
    registered: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<Resolution>>>,
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("id", &self.id)
            .field("categories", &self.categories)
            .field("cursor", &self.cursor)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Waiter {
    /// Create a pending waiter and the receiver its resolution arrives on.
    pub fn new(
        id: WaiterId,
        categories: impl IntoIterator<Item = String>,
        cursor: Cursor,
        deadline: Instant,
    ) -> (Arc<Self>, oneshot::Receiver<Resolution>) {
        let (tx, rx) = oneshot::channel();
        let waiter = Arc::new(Self {
            id,
            categories: categories.into_iter().collect(),
            cursor,
            arrival: Instant::now(),
            deadline,
            registered: AtomicBool::new(false),
            sender: Mutex::new(Some(tx)),
        });
        (waiter, rx)
    }

    pub fn id(&self) -> WaiterId {
        self.id
    }

    pub fn categories(&self) -> &BTreeSet<String> {
        &self.categories
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn arrival(&self) -> Instant {
        self.arrival
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whether no resolution has been claimed yet.
    pub async fn is_pending(&self) -> bool {
        self.sender.lock().await.is_some()
    }

    /// Claim the waiter and hand it `resolution`.
    ///
    /// Returns `false` if another resolver got there first. A closed
    /// receiver still counts as claimed.
    pub async fn resolve(&self, resolution: Resolution) -> bool {
        match self.sender.lock().await.take() {
            Some(tx) => {
                let _ = tx.send(resolution);
                true
            }
            None => false,
        }
    }
}

type WaiterSet = HashMap<WaiterId, Arc<Waiter>>;

/// Outcome of resolving a category against newly available events.
#[derive(Debug, Default)]
pub struct Delivery {
    /// Waiters resolved by this call.
    pub woken: usize,
    /// Ids of every event handed to at least one waiter.
    pub delivered: BTreeSet<u64>,
}

/// Per-category sets of blocked waiters.
///
/// Each category set has its own lock; the outer map is only written when a
/// category is first seen.
#[derive(Default)]
pub struct WaiterRegistry {
    categories: RwLock<HashMap<String, Arc<Mutex<WaiterSet>>>>,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn set(&self, category: &str) -> Option<Arc<Mutex<WaiterSet>>> {
        self.categories.read().await.get(category).cloned()
    }

    async fn set_or_create(&self, category: &str) -> Arc<Mutex<WaiterSet>> {
        if let Some(set) = self.set(category).await {
            return set;
        }
        let mut categories = self.categories.write().await;
        Arc::clone(categories.entry(category.to_string()).or_default())
    }

    /// Add `waiter` under each of its categories.
    pub async fn register(&self, waiter: &Arc<Waiter>) -> Result<(), RegistryError> {
        if !waiter.is_pending().await {
            return Err(RegistryError::NotPending(waiter.id));
        }
        if waiter
            .registered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RegistryError::AlreadyRegistered(waiter.id));
        }

        for category in &waiter.categories {
            let set = self.set_or_create(category).await;
            set.lock().await.insert(waiter.id, Arc::clone(waiter));
        }

        debug!(
            waiter_id = waiter.id,
            categories = ?waiter.categories,
            "Waiter registered"
        );
        Ok(())
    }

    /// Hand `events` to every pending waiter on `category` that has not yet
    /// seen them. Resolved waiters are removed from all their categories.
    pub async fn resolve(&self, category: &str, events: &[Arc<Event>]) -> Delivery {
        let mut delivery = Delivery::default();
        let Some(set) = self.set(category).await else {
            return delivery;
        };

        let mut resolved = Vec::new();
        {
            let mut set = set.lock().await;
            let mut stale = Vec::new();
            for waiter in set.values() {
                let matching: Vec<_> = events
                    .iter()
                    .filter(|e| waiter.cursor.admits(e))
                    .cloned()
                    .collect();
                if matching.is_empty() {
                    continue;
                }
                let ids: Vec<u64> = matching.iter().map(|e| e.id).collect();
                if waiter.resolve(Resolution::Delivered(matching)).await {
                    delivery.woken += 1;
                    delivery.delivered.extend(ids);
                    resolved.push(Arc::clone(waiter));
                } else {
                    stale.push(waiter.id);
                }
            }
            for waiter in &resolved {
                set.remove(&waiter.id);
            }
            for id in stale {
                set.remove(&id);
            }
        }

        for waiter in &resolved {
            self.detach(waiter).await;
        }

        if delivery.woken > 0 {
            debug!(
                category = %category,
                woken = delivery.woken,
                events = delivery.delivered.len(),
                "Delivered events to waiters"
            );
        }
        delivery
    }

    /// Time out every waiter whose deadline is at or before `now`.
    pub async fn expire_deadlines(&self, now: Instant) -> usize {
        let categories: Vec<String> = self.categories.read().await.keys().cloned().collect();
        self.expire_in(categories.iter().map(String::as_str), now)
            .await
    }

    /// Time out expired waiters, looking only at the given categories.
    pub async fn expire_in<'a>(
        &self,
        categories: impl IntoIterator<Item = &'a str>,
        now: Instant,
    ) -> usize {
        let mut expired = 0;
        for category in categories {
            let Some(set) = self.set(category).await else {
                continue;
            };
            let due: Vec<Arc<Waiter>> = set
                .lock()
                .await
                .values()
                .filter(|w| w.deadline <= now)
                .cloned()
                .collect();
            for waiter in due {
                if waiter.resolve(Resolution::TimedOut).await {
                    expired += 1;
                }
                self.detach(&waiter).await;
            }
        }
        if expired > 0 {
            debug!(expired, "Expired waiters past their deadline");
        }
        expired
    }

    /// Time out a single waiter. Returns `false` if it was already resolved.
    pub async fn expire(&self, waiter: &Arc<Waiter>) -> bool {
        let claimed = waiter.resolve(Resolution::TimedOut).await;
        self.detach(waiter).await;
        claimed
    }

    /// Remove `waiter` without delivering anything.
    pub async fn cancel(&self, waiter: &Arc<Waiter>) -> bool {
        let claimed = waiter.resolve(Resolution::Cancelled).await;
        self.detach(waiter).await;
        if claimed {
            debug!(waiter_id = waiter.id, "Waiter cancelled");
        }
        claimed
    }

    /// Cancel every registered waiter. Returns how many were still pending.
    pub async fn cancel_all(&self) -> usize {
        let sets: Vec<_> = self.categories.read().await.values().cloned().collect();
        let mut cancelled = 0;
        for set in sets {
            let waiters: Vec<Arc<Waiter>> = set.lock().await.drain().map(|(_, w)| w).collect();
            for waiter in waiters {
                if waiter.resolve(Resolution::Cancelled).await {
                    cancelled += 1;
                }
                waiter.registered.store(false, Ordering::SeqCst);
            }
        }
        cancelled
    }

    /// Number of waiters currently listed under `category`.
    pub async fn pending(&self, category: &str) -> usize {
        match self.set(category).await {
            Some(set) => set.lock().await.len(),
            None => 0,
        }
    }

    /// Remove `waiter` from all its category sets.
    ///
    /// Sets are locked one at a time in category order, never while holding
    /// another set's lock.
    async fn detach(&self, waiter: &Arc<Waiter>) {
        for category in &waiter.categories {
            if let Some(set) = self.set(category).await {
                set.lock().await.remove(&waiter.id);
            }
        }
        waiter.registered.store(false, Ordering::SeqCst);
    }
}
