//! Single-producer/single-consumer mailbox feeding one publisher worker
//!
//! Bounded by default. When a bounded mailbox is full the
//! [`BackpressurePolicy`] decides between waiting, evicting the oldest entry
//! or rejecting the new one.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Behaviour of a full mailbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackpressurePolicy {
    /// Wait for the worker to make room (stalls the dispatcher)
    #[default]
    Block,
    /// Evict the oldest queued message
    DropOldest,
    /// Reject the incoming message
    DropNewest,
}

/// Outcome of a [`MailboxSender::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Queued after evicting the oldest message
    QueuedDroppedOldest,
    /// Not queued, mailbox full
    Rejected,
    /// Not queued, the worker is gone
    Closed,
}

impl SendOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued | Self::QueuedDroppedOldest)
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    not_empty: Notify,
    not_full: Notify,
}

struct State<T> {
    queue: VecDeque<T>,
    capacity: Option<usize>,
    sender_alive: bool,
    receiver_alive: bool,
}

/// Create a mailbox, `capacity == None` means unbounded
pub fn mailbox<T>(
    capacity: Option<usize>,
    policy: BackpressurePolicy,
) -> (MailboxSender<T>, MailboxReceiver<T>) {
    let capacity = capacity.map(|c| c.max(1));
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::with_capacity(capacity.unwrap_or(16).min(1024)),
            capacity,
            sender_alive: true,
            receiver_alive: true,
        }),
        not_empty: Notify::new(),
        not_full: Notify::new(),
    });

    (
        MailboxSender {
            shared: Arc::clone(&shared),
            policy,
        },
        MailboxReceiver { shared },
    )
}

pub struct MailboxSender<T> {
    shared: Arc<Shared<T>>,
    policy: BackpressurePolicy,
}

pub struct MailboxReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> MailboxSender<T> {
    /// Queue `item`, applying the backpressure policy when full
    pub async fn send(&self, item: T) -> SendOutcome {
        let mut item = Some(item);

        loop {
            {
                let mut state = self.shared.state.lock();
                if !state.receiver_alive {
                    return SendOutcome::Closed;
                }

                let full = state.capacity.is_some_and(|cap| state.queue.len() >= cap);
                let outcome = if !full {
                    SendOutcome::Queued
                } else {
                    match self.policy {
                        BackpressurePolicy::DropNewest => return SendOutcome::Rejected,
                        BackpressurePolicy::DropOldest => {
                            state.queue.pop_front();
                            SendOutcome::QueuedDroppedOldest
                        }
                        BackpressurePolicy::Block => SendOutcome::Rejected,
                    }
                };

                if outcome.is_queued() {
                    if let Some(item) = item.take() {
                        state.queue.push_back(item);
                    }
                    drop(state);
                    self.shared.not_empty.notify_one();
                    return outcome;
                }
            }

            // Block policy, mailbox full
            self.shared.not_full.notified().await;
        }
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the receiving worker has gone away
    pub fn is_closed(&self) -> bool {
        !self.shared.state.lock().receiver_alive
    }
}

impl<T> Drop for MailboxSender<T> {
    fn drop(&mut self) {
        self.shared.state.lock().sender_alive = false;
        self.shared.not_empty.notify_one();
    }
}

impl<T> MailboxReceiver<T> {
    /// Next message; `None` once the sender is gone and the queue is empty
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut state = self.shared.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    drop(state);
                    self.shared.not_full.notify_one();
                    return Some(item);
                }
                if !state.sender_alive {
                    return None;
                }
            }

            self.shared.not_empty.notified().await;
        }
    }

    /// Next message without waiting
    pub fn try_recv(&mut self) -> Option<T> {
        let item = self.shared.state.lock().queue.pop_front();
        if item.is_some() {
            self.shared.not_full.notify_one();
        }
        item
    }

    /// Remove and return everything still queued
    pub fn drain(&mut self) -> Vec<T> {
        let items: Vec<T> = self.shared.state.lock().queue.drain(..).collect();
        self.shared.not_full.notify_one();
        items
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for MailboxReceiver<T> {
    fn drop(&mut self) {
        self.shared.state.lock().receiver_alive = false;
        self.shared.not_full.notify_one();
    }
}
