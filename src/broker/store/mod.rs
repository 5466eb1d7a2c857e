//! Per-category event retention.
//!
//! Each category owns an insertion-ordered buffer bounded by a maximum
//! length (oldest evicted first) and by a time-to-live that is enforced by
//! periodic sweeps rather than on every append.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

/// A published event. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    /// Broker-wide sequence number, strictly increasing in publish order.
    pub id: u64,
    /// Category the event was published to.
    pub category: String,
    /// Opaque payload, delivered verbatim.
    pub body: String,
    /// Creation time in unix milliseconds.
    pub timestamp: i64,
    #[serde(skip)]
    pub(crate) created: Instant,
}

/// Position a subscriber has already seen up to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Events with an id greater than this one.
    Id(u64),
    /// Events created strictly after this unix-millisecond timestamp.
    Time(i64),
}

impl Cursor {
    /// Cursor that admits every retained event.
    pub const START: Cursor = Cursor::Id(0);

    /// Whether `event` lies after this cursor.
    pub fn admits(&self, event: &Event) -> bool {
        match *self {
            Cursor::Id(id) => event.id > id,
            Cursor::Time(millis) => event.timestamp > millis,
        }
    }
}

/// Retention bounds for an [`EventStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Maximum events kept per category. `None` means unbounded.
    pub max_events: Option<usize>,
    /// Maximum age of a retained event. `None` means events never expire.
    pub ttl: Option<Duration>,
}

#[derive(Debug, Default)]
struct CategoryBuffer {
    events: VecDeque<Arc<Event>>,
}

impl CategoryBuffer {
    fn evict_overflow(&mut self, max_events: Option<usize>) -> usize {
        let Some(max) = max_events else {
            return 0;
        };
        let overflow = self.events.len().saturating_sub(max);
        self.events.drain(..overflow);
        overflow
    }

    fn evict_expired(&mut self, cutoff: Instant) -> usize {
        // Buffers are insertion-ordered, so expired events form a prefix.
        let expired = self
            .events
            .iter()
            .take_while(|e| e.created <= cutoff)
            .count();
        self.events.drain(..expired);
        expired
    }
}

/// Mapping from category name to its retained events.
///
/// Categories are created lazily on first publish and never removed; an
/// empty buffer for a known category is a valid state.
pub struct EventStore {
    buffers: RwLock<HashMap<String, Arc<Mutex<CategoryBuffer>>>>,
    next_id: AtomicU64,
    policy: RetentionPolicy,
}

impl EventStore {
    /// Create an empty store.
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            policy,
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Id of the most recently created event, or 0 if none exist yet.
    pub fn high_water(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst) - 1
    }

    async fn buffer(&self, category: &str) -> Option<Arc<Mutex<CategoryBuffer>>> {
        self.buffers.read().await.get(category).cloned()
    }

    async fn buffer_or_create(&self, category: &str) -> Arc<Mutex<CategoryBuffer>> {
        if let Some(buffer) = self.buffer(category).await {
            return buffer;
        }
        let mut buffers = self.buffers.write().await;
        Arc::clone(buffers.entry(category.to_string()).or_default())
    }

    /// Append a new event to `category`, evicting the oldest entries beyond
    /// the configured maximum.
    pub async fn append(&self, category: &str, body: impl Into<String>) -> Arc<Event> {
        let buffer = self.buffer_or_create(category).await;
        let mut buffer = buffer.lock().await;

        // Ids are drawn under the category lock so that id order matches the
        // order in which events become visible within a category.
        let event = Arc::new(Event {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            category: category.to_string(),
            body: body.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            created: Instant::now(),
        });
        buffer.events.push_back(Arc::clone(&event));

        let evicted = buffer.evict_overflow(self.policy.max_events);
        if evicted > 0 {
            debug!(category = %category, evicted, "Evicted oldest events past buffer limit");
        }

        event
    }

    /// Events in `category` lying after `cursor`, oldest first.
    ///
    /// The result is a snapshot; callers poll again with an advanced cursor.
    pub async fn since(&self, category: &str, cursor: Cursor) -> Vec<Arc<Event>> {
        let Some(buffer) = self.buffer(category).await else {
            return Vec::new();
        };
        let buffer = buffer.lock().await;
        buffer
            .events
            .iter()
            .filter(|e| cursor.admits(e))
            .cloned()
            .collect()
    }

    /// Remove specific events from `category`. Returns how many were removed.
    pub async fn remove(&self, category: &str, ids: &[u64]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let Some(buffer) = self.buffer(category).await else {
            return 0;
        };
        let mut buffer = buffer.lock().await;
        let before = buffer.events.len();
        buffer.events.retain(|e| !ids.contains(&e.id));
        before - buffer.events.len()
    }

    /// Drop every event older than the TTL as of `now`. Returns the number
    /// of events removed across all categories.
    pub async fn sweep(&self, now: Instant) -> usize {
        let Some(ttl) = self.policy.ttl else {
            return 0;
        };
        let Some(cutoff) = now.checked_sub(ttl) else {
            return 0;
        };

        let buffers: Vec<_> = self.buffers.read().await.values().cloned().collect();
        let mut removed = 0;
        for buffer in buffers {
            removed += buffer.lock().await.evict_expired(cutoff);
        }
        removed
    }

    /// Number of events currently retained for `category`.
    pub async fn len(&self, category: &str) -> usize {
        match self.buffer(category).await {
            Some(buffer) => buffer.lock().await.events.len(),
            None => 0,
        }
    }

    /// Number of known categories, including ones whose buffer is empty.
    pub async fn category_count(&self) -> usize {
        self.buffers.read().await.len()
    }
}
