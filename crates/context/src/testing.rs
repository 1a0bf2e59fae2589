//! Event sinks used by unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use cordon_worker::{EventSink, EventTask, PostError};
use parking_lot::Mutex;

/// Runs every task on the posting caller.
#[derive(Default)]
pub(crate) struct InlineSink {
	pub closed: AtomicBool,
}

impl EventSink for InlineSink {
	fn post(&self, task: EventTask) -> Result<(), PostError> {
		if self.closed.load(Ordering::Acquire) {
			return Err(PostError::Closed);
		}
		task();
		Ok(())
	}

	fn close(&self) {
		self.closed.store(true, Ordering::Release);
	}
}

/// Accepts tasks and never runs them.
#[derive(Default)]
pub(crate) struct StalledSink {
	pub held: Mutex<Vec<EventTask>>,
	pub closed: AtomicBool,
}

impl EventSink for StalledSink {
	fn post(&self, task: EventTask) -> Result<(), PostError> {
		self.held.lock().push(task);
		Ok(())
	}

	fn close(&self) {
		self.closed.store(true, Ordering::Release);
	}
}

/// Rejects every task.
#[derive(Default)]
pub(crate) struct ClosedSink {
	pub attempts: AtomicUsize,
}

impl EventSink for ClosedSink {
	fn post(&self, _task: EventTask) -> Result<(), PostError> {
		self.attempts.fetch_add(1, Ordering::Relaxed);
		Err(PostError::Closed)
	}
}

pub(crate) fn inline() -> Arc<InlineSink> {
	Arc::new(InlineSink::default())
}

pub(crate) fn init_tracing() {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
