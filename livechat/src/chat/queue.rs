//! Pending message queue.
//!
//! Session-lifetime buffer of outbound messages whose delivery is not yet
//! confirmed. Entries are keyed by the message's temporary id. The queue
//! never sends on its own schedule; the recovery orchestrator calls
//! [`PendingQueue::retry_failed_messages`] once the connection is healthy.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use livechat_proto::message::{ChatId, Message, MessageId, Timestamp};

/// Default number of attempts before an entry is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default pause between attempts within one retry pass.
pub const DEFAULT_RETRY_SPACING: Duration = Duration::from_millis(250);

/// One unconfirmed outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    /// Queue id: the message's temporary id.
    pub id: MessageId,
    /// Target chat.
    pub chat_id: ChatId,
    /// Text content.
    pub content: String,
    /// Message being replied to.
    pub reply_to_id: Option<MessageId>,
    /// When the entry was queued (epoch milliseconds).
    pub created_at_millis: u64,
    /// Failed retry attempts so far.
    pub retry_count: u32,
}

impl PendingMessage {
    /// Build a fresh entry for `message`.
    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            chat_id: message.chat_id.clone(),
            content: message.content.clone(),
            reply_to_id: message.reply_to_id.clone(),
            created_at_millis: Timestamp::now().as_millis(),
            retry_count: 0,
        }
    }
}

/// Queue tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Attempts per entry before it is dropped.
    pub max_retries: u32,
    /// Pause between successive attempts in one pass.
    pub retry_spacing: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_spacing: DEFAULT_RETRY_SPACING,
        }
    }
}

/// Outcome of one retry pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    /// Entries attempted.
    pub attempted: usize,
    /// Entries delivered and removed.
    pub delivered: Vec<MessageId>,
    /// Entries that failed but remain queued.
    pub failed: Vec<MessageId>,
    /// Entries dropped after reaching the retry limit.
    pub dropped: Vec<MessageId>,
    /// The pass did not run because another was in progress.
    pub skipped: bool,
}

/// Clears the in-progress flag even if the pass is cancelled.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Ordered buffer of unconfirmed messages with bounded retry.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: Mutex<Vec<PendingMessage>>,
    config: QueueConfig,
    retrying: AtomicBool,
}

impl PendingQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            config,
            retrying: AtomicBool::new(false),
        }
    }

    /// Queue `message` with a retry count of zero and return its queue id.
    ///
    /// Queuing a message that is already present keeps the existing entry.
    pub fn add_message(&self, message: &Message) -> MessageId {
        let mut entries = self.entries.lock();
        if !entries.iter().any(|e| e.id == message.id) {
            tracing::debug!(message_id = %message.id, chat_id = %message.chat_id, "queued for retry");
            entries.push(PendingMessage::from_message(message));
        }
        message.id.clone()
    }

    /// Remove an entry. Returns whether it was present.
    pub fn remove_message(&self, id: &MessageId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| &e.id != id);
        entries.len() != before
    }

    /// Whether an entry with this id is queued.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.lock().iter().any(|e| &e.id == id)
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Queued entries in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PendingMessage> {
        self.entries.lock().clone()
    }

    /// The queue's configuration.
    #[must_use]
    pub const fn config(&self) -> QueueConfig {
        self.config
    }

    /// Attempt every entry below the retry limit once, in queue order.
    ///
    /// Delivered entries are removed; failed ones have their retry count
    /// bumped and are dropped once it reaches the limit. Attempts are
    /// separated by the configured spacing. A pass started while another is
    /// running returns immediately with `skipped` set.
    pub async fn retry_failed_messages<F, Fut, E>(&self, mut send: F) -> RetryReport
    where
        F: FnMut(PendingMessage) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        if self.retrying.swap(true, Ordering::SeqCst) {
            tracing::debug!("retry pass already running");
            return RetryReport {
                skipped: true,
                ..RetryReport::default()
            };
        }
        let _guard = PassGuard(&self.retrying);

        let batch: Vec<PendingMessage> = self
            .entries
            .lock()
            .iter()
            .filter(|e| e.retry_count < self.config.max_retries)
            .cloned()
            .collect();
        let mut report = RetryReport::default();

        for (i, entry) in batch.into_iter().enumerate() {
            if i > 0 && !self.config.retry_spacing.is_zero() {
                tokio::time::sleep(self.config.retry_spacing).await;
            }
            // Confirmed or deleted while we were waiting.
            if !self.contains(&entry.id) {
                continue;
            }
            let id = entry.id.clone();
            report.attempted += 1;
            match send(entry).await {
                Ok(()) => {
                    self.remove_message(&id);
                    report.delivered.push(id);
                }
                Err(e) => {
                    if self.record_failure(&id) {
                        tracing::warn!(
                            message_id = %id,
                            max_retries = self.config.max_retries,
                            error = %e,
                            "dropping message after final retry"
                        );
                        report.dropped.push(id);
                    } else {
                        tracing::debug!(message_id = %id, error = %e, "retry failed");
                        report.failed.push(id);
                    }
                }
            }
        }
        if report.attempted > 0 {
            tracing::info!(
                attempted = report.attempted,
                delivered = report.delivered.len(),
                dropped = report.dropped.len(),
                "retry pass finished"
            );
        }
        report
    }

    /// Bumps an entry's retry count; removes it and returns `true` at the limit.
    fn record_failure(&self, id: &MessageId) -> bool {
        let mut entries = self.entries.lock();
        let Some(index) = entries.iter().position(|e| &e.id == id) else {
            return false;
        };
        entries[index].retry_count += 1;
        if entries[index].retry_count >= self.config.max_retries {
            entries.remove(index);
            return true;
        }
        false
    }
}
