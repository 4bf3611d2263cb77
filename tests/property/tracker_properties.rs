//! Property tests for the pending queue and the typing tracker.
//!
//! 1. Under any sequence of add / remove / retry passes, the queue never
//!    holds two entries with the same id, and no entry is attempted more
//!    than `max_retries` times before being dropped.
//! 2. Under any sequence of typing / stop-typing signals, the active set
//!    holds exactly the pairs signalled within the expiry window and not
//!    stopped since, and drains completely once the window passes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use livechat::chat::queue::{PendingQueue, QueueConfig};
use livechat::connection::RecordingSink;
use livechat::typing::{TypingConfig, TypingTracker};
use livechat_proto::message::{ChatId, Message, MessageId, UserId};
use livechat_proto::typing::TypingUser;
use parking_lot::Mutex;
use proptest::prelude::*;
use tokio::time::Instant;

const MAX_RETRIES: u32 = 3;
const POOL: usize = 6;

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Pending queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum QueueOp {
    Add(usize),
    Remove(usize),
    Retry { succeed: bool },
}

fn arb_queue_op() -> impl Strategy<Value = QueueOp> {
    prop_oneof![
        3 => (0..POOL).prop_map(QueueOp::Add),
        1 => (0..POOL).prop_map(QueueOp::Remove),
        2 => any::<bool>().prop_map(|succeed| QueueOp::Retry { succeed }),
    ]
}

fn pool() -> Vec<Message> {
    (0..POOL)
        .map(|i| {
            Message::optimistic(
                ChatId::new(format!("c{}", i % 2)),
                UserId::new("me"),
                format!("message {i}"),
                None,
            )
        })
        .collect()
}

proptest! {
    #[test]
    fn queue_ids_unique_and_attempts_bounded(
        ops in prop::collection::vec(arb_queue_op(), 1..40),
    ) {
        let rt = paused_runtime();
        let messages = pool();
        let queue = PendingQueue::new(QueueConfig {
            max_retries: MAX_RETRIES,
            retry_spacing: Duration::ZERO,
        });
        // Attempts since the entry was last (re)queued.
        let attempts: Mutex<HashMap<MessageId, u32>> = Mutex::new(HashMap::new());

        for op in ops {
            match op {
                QueueOp::Add(i) => {
                    let id = &messages[i].id;
                    if !queue.contains(id) {
                        attempts.lock().insert(id.clone(), 0);
                    }
                    queue.add_message(&messages[i]);
                }
                QueueOp::Remove(i) => {
                    queue.remove_message(&messages[i].id);
                }
                QueueOp::Retry { succeed } => {
                    let report = rt.block_on(queue.retry_failed_messages(|entry| {
                        *attempts.lock().entry(entry.id).or_insert(0) += 1;
                        async move {
                            if succeed { Ok(()) } else { Err("offline") }
                        }
                    }));
                    for id in report.delivered.iter().chain(&report.dropped) {
                        prop_assert!(!queue.contains(id));
                    }
                }
            }

            let snapshot = queue.snapshot();
            let ids: HashSet<_> = snapshot.iter().map(|e| e.id.clone()).collect();
            prop_assert_eq!(ids.len(), snapshot.len(), "duplicate queue ids");
            for entry in &snapshot {
                prop_assert!(entry.retry_count < MAX_RETRIES);
            }
            for (id, count) in attempts.lock().iter() {
                prop_assert!(*count <= MAX_RETRIES, "{id} attempted {count} times");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Typing tracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Signal {
    user: u8,
    chat: u8,
    stop: bool,
    wait_ms: u64,
}

fn arb_signal() -> impl Strategy<Value = Signal> {
    (0u8..3, 0u8..2, prop::bool::weighted(0.25), 0u64..4_000).prop_map(
        |(user, chat, stop, wait_ms)| Signal {
            user,
            chat,
            stop,
            wait_ms,
        },
    )
}

fn pair(user: u8, chat: u8) -> TypingUser {
    TypingUser::new(format!("u{user}").as_str(), format!("c{chat}").as_str())
}

proptest! {
    #[test]
    fn typing_set_matches_expiry_model(
        signals in prop::collection::vec(arb_signal(), 1..30),
    ) {
        let rt = paused_runtime();
        let result: Result<(), TestCaseError> = rt.block_on(async {
            let config = TypingConfig::default();
            let tracker = TypingTracker::new(
                Arc::new(RecordingSink::connected()),
                UserId::new("me"),
                config,
            );
            // Pair -> time of its last typing signal, for pairs not stopped since.
            let mut model: HashMap<TypingUser, Instant> = HashMap::new();

            for signal in signals {
                let p = pair(signal.user, signal.chat);
                if signal.stop {
                    tracker.handle_remote_stop(&p);
                    model.remove(&p);
                } else {
                    tracker.handle_remote_typing(p.clone());
                    model.insert(p, Instant::now());
                }
                tokio::time::sleep(Duration::from_millis(signal.wait_ms)).await;
                tokio::task::yield_now().await;

                let active = tracker.active();
                let unique: HashSet<_> = active.iter().cloned().collect();
                prop_assert_eq!(unique.len(), active.len(), "duplicate typing pair");

                for (p, at) in &model {
                    let age = at.elapsed();
                    if age < config.expiry {
                        prop_assert!(tracker.is_typing(p), "{p:?} missing at {age:?}");
                    } else if age > config.expiry {
                        prop_assert!(!tracker.is_typing(p), "{p:?} stale at {age:?}");
                    }
                }
                for p in &active {
                    prop_assert!(model.contains_key(p), "{p:?} active after stop");
                }
            }

            tokio::time::sleep(config.expiry + Duration::from_millis(1)).await;
            tokio::task::yield_now().await;
            prop_assert!(tracker.active().is_empty());
            Ok(())
        });
        result?;
    }
}
