use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// What a bounded mailbox does with a message that arrives while it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
	/// Refuse the incoming message.
	#[default]
	Reject,
	/// Evict the oldest queued message to make room.
	DropOldest,
}

/// Outcome from enqueueing a mailbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MailboxSendOutcome {
	/// Message was enqueued without replacement.
	Enqueued,
	/// Oldest queued message was evicted.
	ReplacedOldest,
}

/// Mailbox send error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MailboxSendError {
	/// Mailbox is closed.
	Closed,
	/// Queue is full and the policy refuses overflow.
	Full,
}

struct MailboxState<T> {
	queue: VecDeque<T>,
	closed: bool,
}

struct MailboxInner<T> {
	capacity: usize,
	policy: OverflowPolicy,
	state: Mutex<MailboxState<T>>,
	notify_recv: Notify,
}

/// Bounded multi-producer, single-consumer FIFO.
///
/// Sending never blocks; receiving is async. The single consumer is woken
/// through `notify_one`, which stores a permit when nobody is parked yet, so a
/// send racing the consumer's emptiness check is never lost.
pub(crate) struct Mailbox<T> {
	inner: Arc<MailboxInner<T>>,
}

impl<T> Clone for Mailbox<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> Mailbox<T> {
	/// Creates a bounded mailbox.
	///
	/// # Panics
	///
	/// Panics if `capacity` is zero.
	pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
		assert!(capacity > 0, "mailbox capacity must be > 0");
		Self {
			inner: Arc::new(MailboxInner {
				capacity,
				policy,
				state: Mutex::new(MailboxState {
					queue: VecDeque::new(),
					closed: false,
				}),
				notify_recv: Notify::new(),
			}),
		}
	}

	/// Enqueues one message according to the overflow policy.
	pub fn try_send(&self, msg: T) -> Result<MailboxSendOutcome, MailboxSendError> {
		let inner = &*self.inner;
		let mut state = inner.state.lock();
		if state.closed {
			return Err(MailboxSendError::Closed);
		}
		let outcome = if state.queue.len() < inner.capacity {
			MailboxSendOutcome::Enqueued
		} else {
			match inner.policy {
				OverflowPolicy::Reject => return Err(MailboxSendError::Full),
				OverflowPolicy::DropOldest => {
					let _ = state.queue.pop_front();
					MailboxSendOutcome::ReplacedOldest
				}
			}
		};
		state.queue.push_back(msg);
		drop(state);
		inner.notify_recv.notify_one();
		Ok(outcome)
	}

	/// Receives the next message, or `None` once closed and drained.
	pub async fn recv(&self) -> Option<T> {
		loop {
			{
				let mut state = self.inner.state.lock();
				if let Some(msg) = state.queue.pop_front() {
					return Some(msg);
				}
				if state.closed {
					return None;
				}
			}
			self.inner.notify_recv.notified().await;
		}
	}

	/// Closes the mailbox. Queued messages stay receivable.
	pub fn close(&self) {
		self.inner.state.lock().closed = true;
		self.inner.notify_recv.notify_one();
	}

	/// Removes every queued message. The messages are dropped after the lock is released.
	pub fn discard(&self) -> usize {
		let queued = std::mem::take(&mut self.inner.state.lock().queue);
		queued.len()
	}

	pub fn is_closed(&self) -> bool {
		self.inner.state.lock().closed
	}

	pub fn len(&self) -> usize {
		self.inner.state.lock().queue.len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.state.lock().queue.is_empty()
	}
}
