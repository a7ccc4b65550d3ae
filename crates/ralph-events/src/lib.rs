//! Single-process pub-sub event bus (§4.1). Publishers never block on subscribers:
//! each subscriber gets an independent bounded channel, and a full channel means the
//! message is dropped for that subscriber only, with a counter recorded.
//!
//! Multiple independent consumers attach the same way: the persistence subscriber,
//! the CLI reporter, and (in daemon mode) the raw ingestion re-broadcast path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ralph_types::Event;

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

struct SubscriberEntry {
    sender: SyncSender<Event>,
    dropped: Arc<AtomicU64>,
}

struct Inner {
    subscribers: Mutex<HashMap<u64, SubscriberEntry>>,
    next_id: AtomicU64,
}

/// The bus is a singleton per run (§9 "Global state"); `Arc`-shared across workers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Publish an event. Never blocks: a subscriber whose channel is full simply
    /// misses this event, and its drop counter increments.
    pub fn emit(&self, event: Event) {
        let subscribers = self.inner.subscribers.lock().expect("event bus mutex poisoned");
        for entry in subscribers.values() {
            match entry.sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    entry.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => {
                    // Receiver gone; the subscriber will be reaped on next release()
                    // or simply never read again. Not an error for the publisher.
                }
            }
        }
    }

    /// Register a new subscriber with the given bounded capacity. Returns the
    /// receiving end and a release handle.
    pub fn subscribe(&self, capacity: usize) -> (Receiver<Event>, Subscription) {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));
        self.inner
            .subscribers
            .lock()
            .expect("event bus mutex poisoned")
            .insert(
                id,
                SubscriberEntry {
                    sender: tx,
                    dropped: dropped.clone(),
                },
            );
        (
            rx,
            Subscription {
                id,
                bus: self.inner.clone(),
                dropped,
            },
        )
    }

    /// Subscribe with the spec's default capacity of 1024.
    pub fn subscribe_default(&self) -> (Receiver<Event>, Subscription) {
        self.subscribe(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().expect("event bus mutex poisoned").len()
    }

    /// Shutdown: give each subscriber up to `deadline` to drain, then drop every
    /// sender, which closes their channels. Best-effort — this bus has no visibility
    /// into per-channel occupancy beyond the drop counter, so "flush" here means
    /// "stop accepting new sends after a grace period," not "guarantee delivery."
    pub fn shutdown(&self, deadline: Duration) {
        let started = Instant::now();
        while started.elapsed() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        self.inner.subscribers.lock().expect("event bus mutex poisoned").clear();
    }

    /// Raw ingestion path for daemon mode: a JSON-lines event emitted by a child
    /// `run` process on stdout. Malformed lines are the caller's responsibility to
    /// log and skip; this just reports the parse error.
    pub fn ingest_raw(&self, line: &str, source: &str) -> Result<(), RawIngestError> {
        if line.len() > 64 * 1024 {
            return Err(RawIngestError::TooLarge(line.len()));
        }
        let mut event: Event = serde_json::from_str(line)
            .map_err(|e| RawIngestError::Malformed(e.to_string()))?;
        event.error = event.error.or_else(|| None);
        let _ = source; // tagging is carried by the caller's persistence layer, not the in-memory Event shape
        self.emit(event);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RawIngestError {
    #[error("malformed event line: {0}")]
    Malformed(String),
    #[error("event line exceeds 64 KiB buffer ({0} bytes)")]
    TooLarge(usize),
}

/// A release handle returned from `subscribe`. Dropping it does *not* unsubscribe —
/// call `release()` explicitly, matching the spec's "subscribe returns a release
/// handle that removes the subscriber and drains its queue."
pub struct Subscription {
    id: u64,
    bus: Arc<Inner>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Remove this subscriber from the bus. Further emits will not reach it. Any
    /// events already queued remain readable on the receiver the caller is holding
    /// until it is dropped.
    pub fn release(self) {
        self.bus
            .subscribers
            .lock()
            .expect("event bus mutex poisoned")
            .remove(&self.id);
    }
}
