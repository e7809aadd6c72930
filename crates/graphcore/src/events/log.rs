//! Append-only per-run event log that can be replayed from the beginning at any time.

use super::base::ExecutionEvent;
use futures::stream::{self, Stream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;

pub struct EventLog {
    events: RwLock<Vec<ExecutionEvent>>,
    closed: AtomicBool,
    /// Bumped on every append and on close
    notify: watch::Sender<u64>,
}

impl EventLog {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            events: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
            notify,
        }
    }

    /// Append an event. Ignored once the log is closed.
    pub fn push(&self, event: ExecutionEvent) {
        if self.is_closed() {
            return;
        }
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        self.notify.send_modify(|version| *version += 1);
    }

    /// Mark the log finished; streams end after draining
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.send_modify(|version| *version += 1);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<ExecutionEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<ExecutionEvent> {
        self.events.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Every event from the first one, then live events until the log closes
    pub fn stream(self: &Arc<Self>) -> impl Stream<Item = ExecutionEvent> + Send + 'static {
        let rx = self.notify.subscribe();
        stream::unfold((Arc::clone(self), 0usize, rx), |(log, cursor, mut rx)| async move {
            loop {
                // mark seen before looking so a concurrent push wakes us
                rx.borrow_and_update();
                if let Some(event) = log.get(cursor) {
                    return Some((event, (log, cursor + 1, rx)));
                }
                if log.is_closed() {
                    return None;
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
