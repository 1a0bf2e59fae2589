//! Multi-phase teardown of one registry.
//!
//! Phases, in order:
//!
//! 1. `Valid -> Disposing`, or return [`DisposeOutcome::AlreadyDisposed`].
//! 2. Fire [`LifecycleEvent::Disposing`] on the caller.
//! 3. Post the teardown task to the group's event sink (release resources,
//!    fire [`LifecycleEvent::ResourcesReleased`]) and wait for it, bounded.
//! 4. Post an empty barrier task and wait for it, bounded.
//! 5. `Disposing -> Disposed`.
//! 6. Close the sink, interrupt every unit of the group subtree and poll until
//!    they are gone, bounded.
//! 7. Unlink the group and its descendants from the index; retire nested registries.
//! 8. Clear the table and cache.
//! 9. Drop the registry from the live count.
//!
//! No wait is retried and no timeout aborts the sequence.

use std::sync::Arc;
use std::time::Duration;

use cordon_worker::{EventSink, EventTask, ExecutionUnit};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::registry::RegistryState;
use crate::resources::ReleaseSummary;
use crate::{ContextError, ContextIndex, LifecycleEvent, Registry};

/// Result of a disposal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposeOutcome {
	/// Another disposal already started; nothing was done.
	AlreadyDisposed,
	Disposed(DisposalReport),
}

/// What a completed disposal managed to do within its time bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisposalReport {
	/// Outcome of the resource release pass, or `None` if it did not finish in time.
	pub resources: Option<ReleaseSummary>,
	/// Whether the barrier task ran before its deadline.
	pub queue_drained: bool,
	/// Units still alive in the group subtree when the interrupt wait ended.
	pub units_remaining: usize,
	/// Index entries removed for the group and its descendants.
	pub groups_removed: usize,
	/// Registries of descendant groups retired along with this one.
	pub retired: usize,
}

impl ContextIndex {
	/// Disposes `registry` on behalf of `caller`.
	///
	/// Fails with [`ContextError::IllegalState`] if `caller` runs inside the
	/// registry's group or one of its descendants; the registry is untouched
	/// in that case.
	pub async fn dispose(&self, registry: &Arc<Registry>, caller: &ExecutionUnit) -> Result<DisposeOutcome, ContextError> {
		if registry.group().is_ancestor_of(caller.group()) {
			return Err(ContextError::IllegalState(format!(
				"{} cannot dispose the registry of its own group '{}'",
				caller.id(),
				registry.group().name()
			)));
		}
		Ok(self.run_disposal(registry).await)
	}

	/// Disposes `registry` from code that is not an execution unit of any group.
	pub async fn dispose_detached(&self, registry: &Arc<Registry>) -> DisposeOutcome {
		self.run_disposal(registry).await
	}

	async fn run_disposal(&self, registry: &Arc<Registry>) -> DisposeOutcome {
		let group = registry.group().clone();
		let name = group.name();

		if !registry.advance(RegistryState::Valid, RegistryState::Disposing) {
			tracing::debug!(group = name, state = ?registry.state(), "context.dispose.skipped");
			return DisposeOutcome::AlreadyDisposed;
		}
		tracing::debug!(group = name, phase = "disposing", "context.dispose.phase");

		let notified = registry.fire(LifecycleEvent::Disposing);
		tracing::trace!(group = name, notified, "context.dispose.notified");

		let timeout = self.config().disposal_timeout();
		let resources = release_on_group(registry, timeout).await;
		tracing::debug!(group = name, phase = "resources_released", completed = resources.is_some(), "context.dispose.phase");

		let queue_drained = wait_for_barrier(registry, timeout).await;
		tracing::debug!(group = name, phase = "queue_drained", completed = queue_drained, "context.dispose.phase");

		registry.advance(RegistryState::Disposing, RegistryState::Disposed);
		tracing::debug!(group = name, phase = "disposed", "context.dispose.phase");

		registry.events().close();
		let units_remaining = self.stop_units(registry).await;

		let unlinked = self.unlink(registry);
		let mut retired = 0;
		for nested in &unlinked.nested {
			if self.retire(nested) {
				retired += 1;
			}
		}

		let cleared = registry.clear();
		let live = self.release_slot();
		tracing::debug!(group = name, groups_removed = unlinked.groups_removed, retired, cleared, live, "context.dispose.done");

		DisposeOutcome::Disposed(DisposalReport {
			resources,
			queue_drained,
			units_remaining,
			groups_removed: unlinked.groups_removed,
			retired,
		})
	}

	async fn stop_units(&self, registry: &Registry) -> usize {
		let group = registry.group();
		let interrupted = group.interrupt_all();
		let poll = self.config().interrupt_poll();
		let deadline = Instant::now() + self.config().interrupt_timeout();

		let mut remaining = group.live_unit_count();
		while remaining > 0 && Instant::now() < deadline {
			tokio::time::sleep(poll).await;
			remaining = group.live_unit_count();
		}

		if remaining > 0 {
			let stragglers: Vec<String> = group.unit_records().iter().map(|r| format!("{}({})", r.name, r.kind)).collect();
			tracing::warn!(group = %group.name(), interrupted, remaining, ?stragglers, "context.dispose.units_remaining");
		}
		remaining
	}

	/// Retires a registry owned by a descendant of a disposed group.
	///
	/// Listeners are not notified. Resources are released on the disposing caller.
	fn retire(&self, registry: &Arc<Registry>) -> bool {
		if !registry.advance(RegistryState::Valid, RegistryState::Disposed) {
			return false;
		}
		registry.events().close();
		let summary = registry.release_resources();
		let cleared = registry.clear();
		self.release_slot();
		tracing::debug!(group = %registry.group().name(), released = summary.released, failed = summary.failed, cleared, "context.dispose.retired");
		true
	}
}

/// Runs the resource release pass on the group's sink and waits for it.
///
/// If the sink refuses the task, the pass runs on the caller instead.
async fn release_on_group(registry: &Arc<Registry>, timeout: Duration) -> Option<ReleaseSummary> {
	let (tx, rx) = oneshot::channel();
	let target = Arc::clone(registry);
	let task: EventTask = Box::new(move || {
		let summary = target.release_resources();
		target.fire(LifecycleEvent::ResourcesReleased);
		let _ = tx.send(summary);
	});

	match registry.events().post(task) {
		Ok(()) => await_signal(registry, "teardown", rx, timeout).await,
		Err(error) => {
			tracing::debug!(group = %registry.group().name(), %error, "context.dispose.teardown_inline");
			let summary = registry.release_resources();
			registry.fire(LifecycleEvent::ResourcesReleased);
			Some(summary)
		}
	}
}

/// Posts an empty task and waits until everything queued before it has run.
async fn wait_for_barrier(registry: &Registry, timeout: Duration) -> bool {
	let (tx, rx) = oneshot::channel();
	let task: EventTask = Box::new(move || {
		let _ = tx.send(());
	});
	match registry.events().post(task) {
		Ok(()) => await_signal(registry, "barrier", rx, timeout).await.is_some(),
		Err(error) => {
			tracing::debug!(group = %registry.group().name(), %error, "context.dispose.barrier_rejected");
			false
		}
	}
}

async fn await_signal<T>(registry: &Registry, step: &'static str, rx: oneshot::Receiver<T>, timeout: Duration) -> Option<T> {
	match tokio::time::timeout(timeout, rx).await {
		Ok(Ok(value)) => Some(value),
		Ok(Err(_)) => {
			tracing::debug!(group = %registry.group().name(), step, "context.dispose.task_dropped");
			None
		}
		Err(_) => {
			tracing::debug!(group = %registry.group().name(), step, timeout_ms = timeout.as_millis() as u64, "context.dispose.timeout");
			None
		}
	}
}

#[cfg(test)]
mod tests;
