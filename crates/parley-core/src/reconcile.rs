//! Media reconciliation.
//!
//! Messages that declare media parts wait here until the upload collaborator
//! has reported every part ready. Waiters are keyed by message id, so an
//! event for one message never delays a waiter for another.
//!
//! Uploads may finish before the message itself reaches the pipeline, so
//! events without a waiter are buffered under their message id until
//! [`MediaReconciler::await_attachments`] claims them or
//! [`MediaReconciler::prune_stale`] drops them.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_protocol::{Attachment, MessageId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Reconciliation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// Not every part arrived within the wait bound.
    #[error("Timed out waiting for media of {message_id}: {received}/{expected} parts")]
    TimedOut {
        /// Message that was waiting.
        message_id: MessageId,
        /// Declared number of parts.
        expected: usize,
        /// Parts that did arrive.
        received: usize,
    },

    /// Another waiter already owns this message id.
    #[error("Message {0} is already awaiting media")]
    AlreadyAwaiting(MessageId),

    /// The entry was released before completion.
    #[error("Media wait for {0} was cancelled")]
    Cancelled(MessageId),
}

/// What a delivered event did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverOutcome {
    /// No waiter yet; the event was buffered.
    Buffered,
    /// A waiter received the part and still needs more.
    Progress {
        /// Parts received so far.
        received: usize,
        /// Parts declared.
        expected: usize,
    },
    /// The waiter has all its parts and was woken.
    Completed,
    /// The same file was already recorded for this message.
    Duplicate,
}

enum Slot {
    Buffered {
        files: Vec<String>,
        since: Instant,
    },
    Waiting {
        waiter: u64,
        expected: usize,
        files: Vec<String>,
        done: oneshot::Sender<Vec<String>>,
    },
}

/// The keyed waiter table.
#[derive(Default)]
pub struct MediaReconciler {
    slots: DashMap<MessageId, Slot>,
    next_waiter: AtomicU64,
}

impl MediaReconciler {
    /// Create an empty reconciler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that one media part of `message_id` is ready.
    pub fn deliver(&self, message_id: &str, file_id: &str) -> DeliverOutcome {
        let mut entry = match self.slots.entry(message_id.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Buffered {
                    files: vec![file_id.to_string()],
                    since: Instant::now(),
                });
                trace!(message_id = %message_id, file_id = %file_id, "Buffered attachment");
                return DeliverOutcome::Buffered;
            }
            Entry::Occupied(entry) => entry,
        };

        let (received, expected) = match entry.get_mut() {
            Slot::Buffered { files, .. } => {
                if files.iter().any(|f| f == file_id) {
                    return DeliverOutcome::Duplicate;
                }
                files.push(file_id.to_string());
                return DeliverOutcome::Buffered;
            }
            Slot::Waiting {
                files, expected, ..
            } => {
                if files.iter().any(|f| f == file_id) {
                    return DeliverOutcome::Duplicate;
                }
                files.push(file_id.to_string());
                (files.len(), *expected)
            }
        };

        if received < expected {
            trace!(message_id = %message_id, received, expected, "Attachment progress");
            return DeliverOutcome::Progress { received, expected };
        }

        if let Slot::Waiting { files, done, .. } = entry.remove() {
            // The waiter may have gone away in the meantime
            let _ = done.send(files);
        }
        debug!(message_id = %message_id, parts = expected, "Attachments complete");
        DeliverOutcome::Completed
    }

    /// Wait until `expected` parts of `message_id` have been delivered.
    ///
    /// Parts are returned in arrival order. A wait for zero parts returns
    /// immediately. Dropping the returned future releases the table entry.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout, or if another waiter already owns the
    /// message id.
    pub async fn await_attachments(
        &self,
        message_id: &str,
        expected: usize,
        timeout: Duration,
    ) -> Result<Vec<Attachment>, ReconcileError> {
        if expected == 0 {
            return Ok(Vec::new());
        }

        let waiter = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let rx = match self.slots.entry(message_id.to_string()) {
            Entry::Vacant(vacant) => {
                let (tx, rx) = oneshot::channel();
                vacant.insert(Slot::Waiting {
                    waiter,
                    expected,
                    files: Vec::with_capacity(expected),
                    done: tx,
                });
                rx
            }
            Entry::Occupied(mut occupied) => {
                let buffered = match occupied.get_mut() {
                    Slot::Waiting { .. } => {
                        return Err(ReconcileError::AlreadyAwaiting(message_id.to_string()));
                    }
                    Slot::Buffered { files, .. } => std::mem::take(files),
                };

                if buffered.len() >= expected {
                    occupied.remove();
                    if buffered.len() > expected {
                        warn!(
                            message_id = %message_id,
                            received = buffered.len(),
                            expected,
                            "Discarding surplus attachments"
                        );
                    }
                    return Ok(to_attachments(buffered, expected));
                }

                let (tx, rx) = oneshot::channel();
                occupied.insert(Slot::Waiting {
                    waiter,
                    expected,
                    files: buffered,
                    done: tx,
                });
                rx
            }
        };

        debug!(message_id = %message_id, expected, "Awaiting attachments");
        let guard = WaiterGuard {
            slots: &self.slots,
            message_id,
            waiter,
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(files)) => Ok(to_attachments(files, expected)),
            Ok(Err(_)) => Err(ReconcileError::Cancelled(message_id.to_string())),
            Err(_) => Err(ReconcileError::TimedOut {
                message_id: message_id.to_string(),
                expected,
                received: guard.release(),
            }),
        }
    }

    /// Drop buffered events nobody claimed within `max_age`.
    ///
    /// Returns the number of message ids dropped. Entries with a waiter are
    /// never pruned.
    pub fn prune_stale(&self, max_age: Duration) -> usize {
        let before = self.slots.len();
        self.slots.retain(|message_id, slot| match slot {
            Slot::Buffered { since, files } if since.elapsed() >= max_age => {
                debug!(message_id = %message_id, parts = files.len(), "Pruned unclaimed attachments");
                false
            }
            _ => true,
        });
        before.saturating_sub(self.slots.len())
    }

    /// Number of message ids with an active waiter.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|e| matches!(e.value(), Slot::Waiting { .. }))
            .count()
    }

    /// Number of message ids holding buffered, unclaimed events.
    #[must_use]
    pub fn buffered_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|e| matches!(e.value(), Slot::Buffered { .. }))
            .count()
    }

    /// Check if the table holds no entries at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn to_attachments(files: Vec<String>, expected: usize) -> Vec<Attachment> {
    files
        .into_iter()
        .take(expected)
        .enumerate()
        .map(|(part, file_id)| Attachment {
            part: part as u32,
            file_id,
        })
        .collect()
}

/// Removes a waiter's entry unless it completed.
struct WaiterGuard<'a> {
    slots: &'a DashMap<MessageId, Slot>,
    message_id: &'a str,
    waiter: u64,
}

impl WaiterGuard<'_> {
    /// Release the entry now, returning how many parts it had received.
    fn release(&self) -> usize {
        self.slots
            .remove_if(self.message_id, |_, slot| self.owns(slot))
            .map(|(_, slot)| match slot {
                Slot::Waiting { files, .. } => files.len(),
                Slot::Buffered { .. } => 0,
            })
            .unwrap_or(0)
    }

    fn owns(&self, slot: &Slot) -> bool {
        matches!(slot, Slot::Waiting { waiter, .. } if *waiter == self.waiter)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.slots.remove_if(self.message_id, |_, slot| self.owns(slot)).is_some() {
            debug!(message_id = %self.message_id, "Released attachment waiter");
        }
    }
}
