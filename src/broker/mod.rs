//! Long-poll event broker.
//!
//! The broker combines an [`EventStore`] with a [`WaiterRegistry`]:
//! publishers append to the store and then wake matching waiters, while
//! subscribers either read retained events immediately or block until an
//! event, their deadline, or cancellation resolves them.
//!
//! A background task sweeps both structures on a fixed interval so expired
//! events and abandoned waiters do not accumulate.

pub mod store;
pub mod waiters;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

pub use store::{Cursor, Event, EventStore, RetentionPolicy};
pub use waiters::{Delivery, RegistryError, Resolution, Waiter, WaiterId, WaiterRegistry};

/// Default upper bound on how long a subscriber may block.
pub const DEFAULT_MAX_LONGPOLL_TIMEOUT: Duration = Duration::from_secs(45);
/// Default number of events retained per category.
pub const DEFAULT_MAX_EVENT_BUFFER_SIZE: usize = 250;
/// Default retention for published events.
pub const DEFAULT_EVENT_TTL: Duration = Duration::from_secs(300);
/// Default interval between eviction sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3);

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors returned by [`Broker`] operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("publication category missing")]
    EmptyCategory,

    #[error("publication body missing")]
    EmptyBody,

    #[error("broker shutting down")]
    ShutDown,
}

/// Tunables for a single broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerOptions {
    /// Longest a subscriber may block; larger requests are clamped.
    pub max_longpoll_timeout: Duration,
    /// Per-category retention cap. `None` disables the cap.
    pub max_event_buffer_size: Option<usize>,
    /// Retention period. `None` keeps events until evicted by the cap.
    pub event_ttl: Option<Duration>,
    /// Drop events from the store once they have been handed to a subscriber.
    pub delete_event_after_first_retrieval: bool,
    /// How often expired events and waiters are swept.
    pub sweep_interval: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            max_longpoll_timeout: DEFAULT_MAX_LONGPOLL_TIMEOUT,
            max_event_buffer_size: Some(DEFAULT_MAX_EVENT_BUFFER_SIZE),
            event_ttl: Some(DEFAULT_EVENT_TTL),
            delete_event_after_first_retrieval: false,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl BrokerOptions {
    fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_events: self.max_event_buffer_size,
            ttl: self.event_ttl,
        }
    }

    /// Clamp a requested wait to `1..=max_longpoll_timeout`; zero or absent
    /// requests get the maximum.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(t) if !t.is_zero() => t.min(self.max_longpoll_timeout),
            _ => self.max_longpoll_timeout,
        }
    }
}

/// Outcome of a subscription that was not cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOutcome {
    /// Delivered events, oldest first. Empty on timeout.
    pub events: Vec<Arc<Event>>,
    /// True if the deadline passed before anything arrived.
    pub timed_out: bool,
    /// Cursor the subscriber should resume from.
    pub cursor: Cursor,
}

impl SubscribeOutcome {
    fn delivered(events: Vec<Arc<Event>>, since: Cursor) -> Self {
        let cursor = events
            .iter()
            .map(|e| e.id)
            .max()
            .map(Cursor::Id)
            .unwrap_or(since);
        Self {
            events,
            timed_out: false,
            cursor,
        }
    }

    fn timed_out(since: Cursor) -> Self {
        Self {
            events: Vec::new(),
            timed_out: true,
            cursor: since,
        }
    }
}

struct Shared {
    store: EventStore,
    waiters: WaiterRegistry,
    options: BrokerOptions,
    next_waiter_id: AtomicU64,
    shut_down: AtomicBool,
}

impl Shared {
    async fn retained_since(&self, categories: &[String], cursor: Cursor) -> Vec<Arc<Event>> {
        let mut events = Vec::new();
        for category in categories {
            events.extend(self.store.since(category, cursor).await);
        }
        events.sort_by_key(|e| e.id);
        events
    }

    /// Apply delete-after-first-retrieval to events that were just handed out.
    async fn retrieved(&self, events: &[Arc<Event>]) {
        if !self.options.delete_event_after_first_retrieval {
            return;
        }
        for event in events {
            self.store.remove(&event.category, &[event.id]).await;
        }
    }

    async fn sweep(&self, now: Instant) {
        let events = self.store.sweep(now).await;
        let waiters = self.waiters.expire_deadlines(now).await;
        if events > 0 || waiters > 0 {
            debug!(
                expired_events = events,
                expired_waiters = waiters,
                "Broker sweep complete"
            );
        }
    }
}

/// Handle to the running sweep task.
struct Sweeper {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Cancels its waiter if dropped while still armed.
///
/// The HTTP host drops a handler's future when the client disconnects, so
/// this is how an abandoned long-poll leaves the registry.
struct CancelOnDrop {
    shared: Arc<Shared>,
    waiter: Option<Arc<Waiter>>,
}

impl CancelOnDrop {
    fn disarm(&mut self) {
        self.waiter = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let Some(waiter) = self.waiter.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        runtime.spawn(async move {
            if shared.waiters.cancel(&waiter).await {
                debug!(waiter_id = waiter.id(), "Subscriber disconnected, waiter cancelled");
            }
        });
    }
}

/// Publish/subscribe broker for one configured rule.
pub struct Broker {
    shared: Arc<Shared>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl Broker {
    /// Create a broker and start its sweep loop on the current runtime.
    pub fn start(options: BrokerOptions) -> Self {
        let shared = Arc::new(Shared {
            store: EventStore::new(options.retention()),
            waiters: WaiterRegistry::new(),
            options,
            next_waiter_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        });
        let sweeper = spawn_sweeper(Arc::clone(&shared));

        info!(
            max_longpoll_timeout = ?shared.options.max_longpoll_timeout,
            max_event_buffer_size = ?shared.options.max_event_buffer_size,
            event_ttl = ?shared.options.event_ttl,
            delete_after_retrieval = shared.options.delete_event_after_first_retrieval,
            "Broker started"
        );

        Self {
            shared,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.shared.options
    }

    pub fn store(&self) -> &EventStore {
        &self.shared.store
    }

    pub fn waiters(&self) -> &WaiterRegistry {
        &self.shared.waiters
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::SeqCst)
    }

    /// Store an event and wake every subscriber blocked on its category.
    #[tracing::instrument(name = "broker.publish", skip_all, fields(category = %category))]
    pub async fn publish(&self, category: &str, body: &str) -> Result<Arc<Event>> {
        if category.trim().is_empty() {
            return Err(BrokerError::EmptyCategory);
        }
        if body.trim().is_empty() {
            return Err(BrokerError::EmptyBody);
        }
        if self.is_shut_down() {
            return Err(BrokerError::ShutDown);
        }

        let shared = &self.shared;
        let event = shared.store.append(category, body).await;

        // A subscriber registering after this check finds the event in its
        // post-registration re-read of the store.
        if shared.waiters.pending(category).await == 0 {
            debug!(event_id = event.id, woken = 0, "Event published");
            return Ok(event);
        }

        // Waiters get the whole retained tail and filter it by their own
        // cursor, so an event appended between a subscriber's store check
        // and its registration is still delivered.
        let retained = shared.store.since(category, Cursor::START).await;
        let delivery = shared.waiters.resolve(category, &retained).await;
        if shared.options.delete_event_after_first_retrieval && !delivery.delivered.is_empty() {
            let ids: Vec<u64> = delivery.delivered.iter().copied().collect();
            shared.store.remove(category, &ids).await;
        }

        debug!(event_id = event.id, woken = delivery.woken, "Event published");
        Ok(event)
    }

    /// Wait for events in `category` after `since`.
    ///
    /// Without a cursor only events published after the call are returned.
    /// Returns immediately if matching events are already retained;
    /// otherwise blocks until one arrives or the (clamped) timeout passes.
    /// Dropping the returned future cancels the subscription.
    pub async fn subscribe(
        &self,
        category: &str,
        timeout: Option<Duration>,
        since: Option<Cursor>,
    ) -> Result<SubscribeOutcome> {
        self.subscribe_all(&[category.to_string()], timeout, since)
            .await
    }

    /// Like [`Broker::subscribe`], waiting on any of several categories.
    ///
    /// Repeated categories are treated as one.
    pub async fn subscribe_all(
        &self,
        categories: &[String],
        timeout: Option<Duration>,
        since: Option<Cursor>,
    ) -> Result<SubscribeOutcome> {
        if categories.is_empty() || categories.iter().any(|c| c.trim().is_empty()) {
            return Err(BrokerError::EmptyCategory);
        }
        let categories: Vec<String> = categories
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let categories = categories.as_slice();
        if self.is_shut_down() {
            return Err(BrokerError::ShutDown);
        }

        let shared = &self.shared;
        let cursor = since.unwrap_or(Cursor::Id(shared.store.high_water()));

        let ready = shared.retained_since(categories, cursor).await;
        if !ready.is_empty() {
            shared.retrieved(&ready).await;
            return Ok(SubscribeOutcome::delivered(ready, cursor));
        }

        let timeout = shared.options.effective_timeout(timeout);
        let deadline = Instant::now() + timeout;
        let id = shared.next_waiter_id.fetch_add(1, Ordering::SeqCst);
        let (waiter, rx) = Waiter::new(id, categories.iter().cloned(), cursor, deadline);

        if let Err(e) = shared.waiters.register(&waiter).await {
            error!(waiter_id = id, error = %e, "Waiter registration invariant violated");
            debug_assert!(false, "fresh waiter failed to register: {e}");
            return Ok(SubscribeOutcome::timed_out(cursor));
        }
        let mut guard = CancelOnDrop {
            shared: Arc::clone(shared),
            waiter: Some(Arc::clone(&waiter)),
        };

        shared
            .waiters
            .expire_in(categories.iter().map(String::as_str), Instant::now())
            .await;

        // Close the window between the check above and registration.
        let raced = shared.retained_since(categories, cursor).await;
        if !raced.is_empty() {
            waiter.resolve(Resolution::Delivered(raced)).await;
            shared.waiters.cancel(&waiter).await;
        } else if self.is_shut_down() {
            shared.waiters.cancel(&waiter).await;
        }

        let resolution = wait_for(&shared.waiters, &waiter, rx, deadline).await;
        guard.disarm();

        match resolution {
            Resolution::Delivered(events) => {
                shared.retrieved(&events).await;
                Ok(SubscribeOutcome::delivered(events, cursor))
            }
            Resolution::TimedOut => Ok(SubscribeOutcome::timed_out(cursor)),
            Resolution::Cancelled => Err(BrokerError::ShutDown),
        }
    }

    /// Stop the sweep loop and release every blocked subscriber.
    ///
    /// Only the first call has any effect.
    pub async fn shutdown(&self) {
        let Some(sweeper) = self.sweeper.lock().await.take() else {
            return;
        };
        self.shared.shut_down.store(true, Ordering::SeqCst);

        let _ = sweeper.cancel.send(true);
        if let Err(e) = sweeper.handle.await {
            error!(error = %e, "Broker sweep task failed");
        }

        let released = self.shared.waiters.cancel_all().await;
        info!(released, "Broker stopped");
    }
}

/// Block until `waiter` is resolved, timing it out at `deadline`.
async fn wait_for(
    registry: &WaiterRegistry,
    waiter: &Arc<Waiter>,
    mut rx: oneshot::Receiver<Resolution>,
    deadline: Instant,
) -> Resolution {
    tokio::select! {
        resolution = &mut rx => return resolution.unwrap_or(Resolution::Cancelled),
        _ = tokio::time::sleep_until(deadline) => {}
    }
    // Whoever claimed the waiter (possibly this expiry) has already sent.
    registry.expire(waiter).await;
    rx.await.unwrap_or(Resolution::Cancelled)
}

fn spawn_sweeper(shared: Arc<Shared>) -> Sweeper {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    let period = shared.options.sweep_interval;

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(interval = ?period, "Broker sweep task started");

        loop {
            tokio::select! {
                _ = ticker.tick() => shared.sweep(Instant::now()).await,
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        debug!("Broker sweep task stopped");
                        break;
                    }
                }
            }
        }
    });

    Sweeper {
        cancel: cancel_tx,
        handle,
    }
}
