//! Lifecycle events and subscriber bookkeeping.

use std::fmt;
use std::sync::Arc;

use cordon_worker::panic_message;
use parking_lot::Mutex;

/// Lifecycle milestones announced to subscribers during disposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
	/// Disposal has started; emitted before any teardown work.
	Disposing,
	/// Top-level resources of the group have been released.
	ResourcesReleased,
}

impl LifecycleEvent {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Disposing => "disposing",
			Self::ResourcesReleased => "resources_released",
		}
	}
}

impl fmt::Display for LifecycleEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleChange {
	pub event: LifecycleEvent,
	pub old_value: bool,
	pub new_value: bool,
}

impl LifecycleChange {
	pub(crate) const fn raised(event: LifecycleEvent) -> Self {
		Self {
			event,
			old_value: false,
			new_value: true,
		}
	}
}

/// Receives lifecycle notifications from a registry.
pub trait LifecycleListener: Send + Sync {
	fn notify(&self, change: &LifecycleChange);
}

impl<F> LifecycleListener for F
where
	F: Fn(&LifecycleChange) + Send + Sync,
{
	fn notify(&self, change: &LifecycleChange) {
		self(change)
	}
}

struct Subscription {
	filter: Option<LifecycleEvent>,
	listener: Arc<dyn LifecycleListener>,
}

impl Subscription {
	fn matches(&self, filter: Option<LifecycleEvent>, listener: &Arc<dyn LifecycleListener>) -> bool {
		self.filter == filter && same_listener(&self.listener, listener)
	}

	fn accepts(&self, event: LifecycleEvent) -> bool {
		self.filter.is_none_or(|wanted| wanted == event)
	}
}

fn same_listener(a: &Arc<dyn LifecycleListener>, b: &Arc<dyn LifecycleListener>) -> bool {
	std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Ordered set of (filter, listener) subscriptions.
#[derive(Default)]
pub(crate) struct ListenerSet {
	entries: Mutex<Vec<Subscription>>,
}

impl ListenerSet {
	/// Adds a subscription. Returns false if the same pair is already present.
	pub fn add(&self, filter: Option<LifecycleEvent>, listener: Arc<dyn LifecycleListener>) -> bool {
		let mut entries = self.entries.lock();
		if entries.iter().any(|s| s.matches(filter, &listener)) {
			return false;
		}
		entries.push(Subscription { filter, listener });
		true
	}

	/// Removes a subscription. Returns false if it was not present.
	pub fn remove(&self, filter: Option<LifecycleEvent>, listener: &Arc<dyn LifecycleListener>) -> bool {
		let mut entries = self.entries.lock();
		match entries.iter().position(|s| s.matches(filter, listener)) {
			Some(index) => {
				entries.remove(index);
				true
			}
			None => false,
		}
	}

	pub fn all(&self) -> Vec<Arc<dyn LifecycleListener>> {
		self.entries.lock().iter().map(|s| Arc::clone(&s.listener)).collect()
	}

	/// Listeners subscribed to exactly `event`, excluding catch-all subscriptions.
	pub fn for_event(&self, event: LifecycleEvent) -> Vec<Arc<dyn LifecycleListener>> {
		self.entries
			.lock()
			.iter()
			.filter(|s| s.filter == Some(event))
			.map(|s| Arc::clone(&s.listener))
			.collect()
	}

	/// Delivers `event` to every accepting listener in subscription order.
	///
	/// The set is snapshotted first so listeners may (un)subscribe while being
	/// notified. A panicking listener is logged and skipped.
	pub fn fire(&self, owner: &str, event: LifecycleEvent) -> usize {
		let targets: Vec<_> = self
			.entries
			.lock()
			.iter()
			.filter(|s| s.accepts(event))
			.map(|s| Arc::clone(&s.listener))
			.collect();
		let change = LifecycleChange::raised(event);
		let mut delivered = 0;
		for listener in targets {
			match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener.notify(&change))) {
				Ok(()) => delivered += 1,
				Err(payload) => {
					tracing::warn!(group = owner, %event, panic = %panic_message(payload.as_ref()), "context.listener.panicked");
				}
			}
		}
		delivered
	}
}
