use super::types::{OfflineEvent, ProgressEvent, StatusEvent};
use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

use crate::models::BookId;

/// Event subscriber handle
pub struct EventSubscriber {
    receiver: broadcast::Receiver<OfflineEvent>,
    filter: Option<EventFilter>,
}

impl EventSubscriber {
    /// Create a new subscriber with an optional filter
    pub fn new(receiver: broadcast::Receiver<OfflineEvent>, filter: Option<EventFilter>) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next event matching the filter.
    ///
    /// A subscriber that falls behind silently skips what it missed; the
    /// query command is how observers reconcile.
    pub async fn recv(&mut self) -> Result<OfflineEvent> {
        loop {
            let event = match self.receiver.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!("Subscriber lagged, skipped {} events", skipped);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Try to receive without blocking
    pub fn try_recv(&mut self) -> Result<Option<OfflineEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Ok(Some(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn accepts(&self, event: &OfflineEvent) -> bool {
        self.filter.as_ref().is_none_or(|f| f.matches(event))
    }
}

/// Event filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    book_ids: Option<Vec<BookId>>,
    statuses_only: bool,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only events for these books. `cleared_all` always passes since it
    /// concerns every book.
    pub fn with_books(mut self, book_ids: Vec<BookId>) -> Self {
        self.book_ids = Some(book_ids);
        self
    }

    pub fn statuses_only(mut self) -> Self {
        self.statuses_only = true;
        self
    }

    pub fn matches(&self, event: &OfflineEvent) -> bool {
        if self.statuses_only && !matches!(event, OfflineEvent::Status(_)) {
            return false;
        }

        if let Some(ref books) = self.book_ids
            && let Some(book_id) = event.book_id()
            && !books.contains(book_id)
        {
            return false;
        }

        true
    }
}

/// Best-effort broadcast of progress and status events. Observers that are
/// not listening when an event fires simply miss it.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OfflineEvent>,
    stats: Arc<EventBusStats>,
}

#[derive(Debug, Default)]
pub struct EventBusStats {
    total_events: AtomicU64,
    progress_events: AtomicU64,
    status_events: AtomicU64,
    undelivered_events: AtomicU64,
}

impl EventBusStats {
    pub fn total_events(&self) -> u64 {
        self.total_events.load(Ordering::Relaxed)
    }

    pub fn progress_events(&self) -> u64 {
        self.progress_events.load(Ordering::Relaxed)
    }

    pub fn status_events(&self) -> u64 {
        self.status_events.load(Ordering::Relaxed)
    }

    pub fn undelivered_events(&self) -> u64 {
        self.undelivered_events.load(Ordering::Relaxed)
    }
}

impl EventBus {
    /// Create a new event bus with specified buffer capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            stats: Arc::new(EventBusStats::default()),
        }
    }

    /// Publish an event to all current subscribers. Never fails.
    pub fn publish(&self, event: impl Into<OfflineEvent>) {
        let event = event.into();
        trace!("Publishing {} event for {:?}", event.as_str(), event.book_id());

        self.stats.total_events.fetch_add(1, Ordering::Relaxed);
        match event {
            OfflineEvent::Progress(_) => self.stats.progress_events.fetch_add(1, Ordering::Relaxed),
            OfflineEvent::Status(_) => self.stats.status_events.fetch_add(1, Ordering::Relaxed),
        };

        if self.sender.send(event).is_err() {
            // No subscribers is normal
            self.stats.undelivered_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn emit_status(&self, event: StatusEvent) {
        self.publish(event);
    }

    pub fn emit_progress(&self, event: ProgressEvent) {
        self.publish(event);
    }

    /// Subscribe to all events
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber::new(self.sender.subscribe(), None)
    }

    /// Subscribe with a filter
    pub fn subscribe_filtered(&self, filter: EventFilter) -> EventSubscriber {
        EventSubscriber::new(self.sender.subscribe(), Some(filter))
    }

    pub fn stats(&self) -> &EventBusStats {
        &self.stats
    }
}
