//! Single-slot, latest-wins frame relay.
//!
//! One producer overwrites the slot; any number of consumers wait for a
//! sequence number newer than the last one they saw. Nothing is queued, so
//! slow consumers skip frames and memory stays at one frame regardless of how
//! many clients are connected. Consumers carry their own `last_seen` and need
//! no registration.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::Frame;

/// Result of [`Relay::wait_next`]
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    Frame { sequence: u64, frame: Frame },
    /// No newer frame arrived in time. Not an error: callers probe their
    /// connection and wait again.
    Timeout,
}

/// Sequence number and frame are swapped in together so a waiter can never
/// observe one without the other.
struct Slot {
    sequence: u64,
    frame: Frame,
}

struct Inner {
    latest: ArcSwapOption<Slot>,
    notify: Notify,
}

/// Cheap handle; clones share the same slot.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<Inner>,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Relay {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                latest: ArcSwapOption::empty(),
                notify: Notify::new(),
            }),
        }
    }

    /// Replace the stored frame and wake every waiter. Never blocks.
    ///
    /// Returns the sequence number assigned to `frame`; the first publish is 1.
    pub fn publish(&self, frame: Frame) -> u64 {
        let previous = self.inner.latest.rcu(|current| {
            let sequence = current.as_ref().map_or(0, |slot| slot.sequence) + 1;
            Some(Arc::new(Slot {
                sequence,
                frame: frame.clone(),
            }))
        });
        let sequence = previous.as_ref().map_or(0, |slot| slot.sequence) + 1;

        self.inner.notify.notify_waiters();
        metrics::counter!("hermes_frames_published_total").increment(1);
        trace!(sequence, bytes = frame.len(), "frame published");
        sequence
    }

    /// Sequence number of the stored frame, 0 before the first publish.
    pub fn sequence(&self) -> u64 {
        match &*self.inner.latest.load() {
            Some(slot) => slot.sequence,
            None => 0,
        }
    }

    /// Most recent frame, if any has been published.
    pub fn latest(&self) -> Option<(u64, Frame)> {
        self.inner
            .latest
            .load_full()
            .map(|slot| (slot.sequence, slot.frame.clone()))
    }

    /// Wait until a frame newer than `last_seen` is stored, or `timeout` elapses.
    ///
    /// Pass 0 to accept any frame. Blocks (rather than failing) if nothing has
    /// been published yet.
    pub async fn wait_next(&self, last_seen: u64, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking the slot, otherwise a publish
            // landing between the check and the await would be missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(slot) = self.inner.latest.load_full() {
                if slot.sequence > last_seen {
                    return WaitOutcome::Frame {
                        sequence: slot.sequence,
                        frame: slot.frame.clone(),
                    };
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return WaitOutcome::Timeout;
            }
        }
    }
}
