//! Per-group event queue.
//!
//! Tasks posted to an [`EventQueue`] run one at a time, in submission order,
//! on a dispatcher unit that belongs to the queue's group. The dispatcher is
//! started lazily on the first post. An interrupted dispatcher that exits
//! with tasks still queued starts its own replacement, and a later post
//! restarts it otherwise. Closing the queue stops it for good and drops
//! pending tasks.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mailbox::{Mailbox, MailboxSendError, MailboxSendOutcome, OverflowPolicy};
use crate::panic::panic_message;
use crate::{ExecutionGroup, ExecutionUnit, TaskUnit, UnitKind};

/// One unit of work for an event queue.
pub type EventTask = Box<dyn FnOnce() + Send + 'static>;

/// Failure to post a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PostError {
	#[error("event queue is closed")]
	Closed,
	#[error("event queue is full")]
	Full,
}

/// Event-processing subsystem of one group.
pub trait EventSink: Send + Sync + 'static {
	/// Submits a task to run asynchronously on a unit of the owning group.
	fn post(&self, task: EventTask) -> Result<(), PostError>;

	/// Stops accepting tasks.
	fn close(&self) {}
}

/// Sizing and overflow configuration for an [`EventQueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventQueueSpec {
	pub capacity: usize,
	pub overflow: OverflowPolicy,
}

impl Default for EventQueueSpec {
	fn default() -> Self {
		Self {
			capacity: 1024,
			overflow: OverflowPolicy::Reject,
		}
	}
}

struct Dispatcher {
	task: TaskUnit<()>,
	running: bool,
}

impl Dispatcher {
	fn is_active(&self) -> bool {
		self.running && !self.task.is_finished()
	}
}

struct Shared {
	group: ExecutionGroup,
	mailbox: Mailbox<EventTask>,
	dispatcher: Mutex<Option<Dispatcher>>,
}

/// FIFO event queue drained by a dispatcher unit of the owning group.
pub struct EventQueue {
	shared: Arc<Shared>,
}

impl EventQueue {
	/// Creates a queue for `group`.
	///
	/// # Panics
	///
	/// Panics if `spec.capacity` is zero.
	pub fn new(group: ExecutionGroup, spec: &EventQueueSpec) -> Self {
		Self {
			shared: Arc::new(Shared {
				group,
				mailbox: Mailbox::new(spec.capacity, spec.overflow),
				dispatcher: Mutex::new(None),
			}),
		}
	}

	pub fn group(&self) -> &ExecutionGroup {
		&self.shared.group
	}

	/// Number of tasks waiting to run.
	pub fn pending(&self) -> usize {
		self.shared.mailbox.len()
	}

	pub fn is_closed(&self) -> bool {
		self.shared.mailbox.is_closed()
	}

	/// Returns the current dispatcher unit, if one is running.
	pub fn dispatcher(&self) -> Option<ExecutionUnit> {
		let guard = self.shared.dispatcher.lock();
		guard.as_ref().filter(|d| d.is_active()).map(|d| d.task.unit().clone())
	}
}

impl Shared {
	fn ensure_dispatcher(self: &Arc<Self>) {
		let mut guard = self.dispatcher.lock();
		if guard.as_ref().is_some_and(Dispatcher::is_active) {
			return;
		}
		self.start_dispatcher(&mut guard);
	}

	/// Spawns a dispatcher. The caller holds the `dispatcher` lock and has seen no running one.
	fn start_dispatcher(self: &Arc<Self>, slot: &mut Option<Dispatcher>) {
		let shared = Arc::downgrade(self);
		let mailbox = self.mailbox.clone();
		let name = format!("event-dispatch-{}", self.group.name());
		let task = self.group.spawn_task_as(UnitKind::Dispatcher, name, move |ctx| async move {
			loop {
				let next = tokio::select! {
					biased;
					_ = ctx.interrupted() => break,
					next = mailbox.recv() => next,
				};
				let Some(task) = next else { break };
				if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
					tracing::warn!(group = %ctx.group().name(), panic = %panic_message(payload.as_ref()), "worker.event_queue.task_panicked");
				}
			}
			tracing::debug!(group = %ctx.group().name(), interrupted = ctx.is_interrupted(), "worker.event_queue.dispatcher_exit");
			Shared::dispatcher_exited(&shared, ctx.unit());
		});
		*slot = Some(Dispatcher { task, running: true });
	}

	/// Marks `unit` as stopped and hands any tasks it left behind to a fresh dispatcher.
	fn dispatcher_exited(shared: &Weak<Self>, unit: &ExecutionUnit) {
		let Some(shared) = shared.upgrade() else { return };
		let mut guard = shared.dispatcher.lock();
		match guard.as_mut() {
			Some(current) if current.task.unit() == unit => current.running = false,
			_ => return,
		}
		if !shared.mailbox.is_empty() && !shared.mailbox.is_closed() {
			tracing::debug!(group = %shared.group.name(), pending = shared.mailbox.len(), "worker.event_queue.dispatcher_restart");
			shared.start_dispatcher(&mut guard);
		}
	}
}

impl EventSink for EventQueue {
	fn post(&self, task: EventTask) -> Result<(), PostError> {
		let shared = &self.shared;
		match shared.mailbox.try_send(task) {
			Ok(MailboxSendOutcome::Enqueued) => {}
			Ok(MailboxSendOutcome::ReplacedOldest) => {
				tracing::debug!(group = %shared.group.name(), "worker.event_queue.dropped_oldest");
			}
			Err(MailboxSendError::Closed) => return Err(PostError::Closed),
			Err(MailboxSendError::Full) => return Err(PostError::Full),
		}
		shared.ensure_dispatcher();
		Ok(())
	}

	fn close(&self) {
		let shared = &self.shared;
		shared.mailbox.close();
		let discarded = shared.mailbox.discard();
		if discarded > 0 {
			tracing::debug!(group = %shared.group.name(), discarded, "worker.event_queue.discarded");
		}
		if let Some(dispatcher) = shared.dispatcher.lock().as_ref() {
			dispatcher.task.unit().interrupt();
		}
	}
}

impl fmt::Debug for EventQueue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EventQueue")
			.field("group", &self.shared.group.name())
			.field("pending", &self.pending())
			.field("closed", &self.is_closed())
			.finish()
	}
}
