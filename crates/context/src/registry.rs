//! Per-group registry.
//!
//! # Invariants
//!
//! - `get`, `put`, `remove` and `clear` serialize on one table lock; the MRU
//!   pair is only touched under it.
//! - A cached key always reflects the last write for that key.
//! - State moves `Valid -> Disposing -> Disposed` and never back. Once
//!   `Disposed`, the table is empty and writes are ignored.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use cordon_worker::{EventSink, ExecutionGroup, Loader};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::cache::RecentPair;
use crate::lifecycle::{LifecycleEvent, LifecycleListener, ListenerSet};
use crate::resources::{ReleaseSummary, ResourceSet, TopLevelResource, release_one};
use crate::{ContextError, ContextKey, TypedKey, Value};

/// Lifecycle state of a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegistryState {
	Valid = 0,
	Disposing = 1,
	Disposed = 2,
}

impl RegistryState {
	const fn from_u8(raw: u8) -> Self {
		match raw {
			0 => Self::Valid,
			1 => Self::Disposing,
			_ => Self::Disposed,
		}
	}
}

/// Table and cache counters of one registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
	pub entries: usize,
	pub hits: u64,
	pub misses: u64,
}

#[derive(Default)]
struct Table {
	entries: FxHashMap<ContextKey, Value>,
	recent: RecentPair,
	hits: u64,
	misses: u64,
}

/// Service table private to one execution group and its undelegated descendants.
pub struct Registry {
	group: ExecutionGroup,
	loader: Option<Loader>,
	state: AtomicU8,
	table: Mutex<Table>,
	listeners: ListenerSet,
	resources: ResourceSet,
	events: Arc<dyn EventSink>,
}

impl Registry {
	pub(crate) fn new(group: ExecutionGroup, loader: Option<Loader>, events: Arc<dyn EventSink>) -> Self {
		Self {
			group,
			loader,
			state: AtomicU8::new(RegistryState::Valid as u8),
			table: Mutex::new(Table::default()),
			listeners: ListenerSet::default(),
			resources: ResourceSet::default(),
			events,
		}
	}

	/// Returns the group this registry is bound to.
	pub fn group(&self) -> &ExecutionGroup {
		&self.group
	}

	/// Returns the loader snapshot of the unit that created this registry.
	pub fn creation_loader(&self) -> Option<&Loader> {
		self.loader.as_ref()
	}

	/// Returns the group's event-processing sink.
	pub fn events(&self) -> &Arc<dyn EventSink> {
		&self.events
	}

	pub fn state(&self) -> RegistryState {
		RegistryState::from_u8(self.state.load(Ordering::Acquire))
	}

	pub fn is_disposed(&self) -> bool {
		self.state() == RegistryState::Disposed
	}

	/// Moves `from -> to`; false if the registry was not in `from`.
	pub(crate) fn advance(&self, from: RegistryState, to: RegistryState) -> bool {
		self.state
			.compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
	}

	/// Looks up `key`, answering from the MRU slot when `key` was the last one asked for.
	pub fn get(&self, key: &ContextKey) -> Option<Value> {
		let mut table = self.table.lock();
		if self.is_disposed() {
			return None;
		}
		if let Some(hit) = table.recent.lookup(key) {
			table.hits += 1;
			return hit;
		}
		let value = table.entries.get(key).cloned();
		table.misses += 1;
		table.recent.install(key, value.clone());
		value
	}

	/// Maps `key` to `value`, returning the previous value.
	pub fn put(&self, key: &ContextKey, value: Value) -> Option<Value> {
		let mut table = self.table.lock();
		if self.is_disposed() {
			tracing::debug!(group = %self.group.name(), %key, "context.put.ignored_disposed");
			return None;
		}
		table.recent.refresh(key, Some(Arc::clone(&value)));
		table.entries.insert(key.clone(), value)
	}

	/// Like [`Self::put`] for callers holding optional arguments.
	pub fn try_put(&self, key: Option<&ContextKey>, value: Option<Value>) -> Result<Option<Value>, ContextError> {
		let key = key.ok_or(ContextError::InvalidArgument("key is absent"))?;
		let value = value.ok_or(ContextError::InvalidArgument("value is absent"))?;
		Ok(self.put(key, value))
	}

	/// Removes `key`, returning the previous value.
	pub fn remove(&self, key: &ContextKey) -> Option<Value> {
		let mut table = self.table.lock();
		table.recent.refresh(key, None);
		table.entries.remove(key)
	}

	pub fn contains_key(&self, key: &ContextKey) -> bool {
		self.get(key).is_some()
	}

	pub fn len(&self) -> usize {
		self.table.lock().entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn get_typed<T: Any + Send + Sync>(&self, key: &TypedKey<T>) -> Option<Arc<T>> {
		self.get(key.raw())?.downcast::<T>().ok()
	}

	/// Stores `value` under a typed key, returning the previous value if it had type `T`.
	pub fn put_typed<T: Any + Send + Sync>(&self, key: &TypedKey<T>, value: T) -> Option<Arc<T>> {
		self.put(key.raw(), Arc::new(value))?.downcast::<T>().ok()
	}

	/// Returns the value under `key`, computing and storing it if absent.
	///
	/// `init` runs without the table lock held and may itself use the
	/// registry. If another caller stored a value in the meantime, that value
	/// wins and the freshly built one is dropped. On a disposed registry the
	/// fresh value is returned without being stored.
	pub fn get_or_init<T: Any + Send + Sync>(&self, key: &TypedKey<T>, init: impl FnOnce() -> T) -> Arc<T> {
		if let Some(existing) = self.get_typed(key) {
			return existing;
		}
		let fresh = Arc::new(init());
		let mut table = self.table.lock();
		if self.is_disposed() {
			return fresh;
		}
		if let Some(existing) = table.entries.get(key.raw()).cloned().and_then(|v| v.downcast::<T>().ok()) {
			return existing;
		}
		let value: Value = Arc::clone(&fresh) as Value;
		table.recent.refresh(key.raw(), Some(Arc::clone(&value)));
		table.entries.insert(key.raw().clone(), value);
		fresh
	}

	/// Returns table and cache counters.
	pub fn stats(&self) -> RegistryStats {
		let table = self.table.lock();
		RegistryStats {
			entries: table.entries.len(),
			hits: table.hits,
			misses: table.misses,
		}
	}

	/// Empties the table and both cache slots. Values are dropped after the lock is released.
	pub(crate) fn clear(&self) -> usize {
		let mut table = self.table.lock();
		let drained = std::mem::take(&mut table.entries);
		table.recent.reset();
		drop(table);
		drained.len()
	}

	/// Subscribes `listener` to `filter` (or to every event when `None`).
	///
	/// Returns false if the same pair was already subscribed.
	pub fn add_listener(&self, filter: Option<LifecycleEvent>, listener: Arc<dyn LifecycleListener>) -> bool {
		self.listeners.add(filter, listener)
	}

	/// Removes one subscription; unknown pairs are ignored.
	pub fn remove_listener(&self, filter: Option<LifecycleEvent>, listener: &Arc<dyn LifecycleListener>) -> bool {
		self.listeners.remove(filter, listener)
	}

	/// Every subscribed listener, in subscription order.
	pub fn listeners(&self) -> Vec<Arc<dyn LifecycleListener>> {
		self.listeners.all()
	}

	/// Listeners subscribed specifically to `event`.
	pub fn listeners_for(&self, event: LifecycleEvent) -> Vec<Arc<dyn LifecycleListener>> {
		self.listeners.for_event(event)
	}

	pub(crate) fn fire(&self, event: LifecycleEvent) -> usize {
		self.listeners.fire(self.group.name(), event)
	}

	/// Attaches a resource to release during disposal.
	///
	/// If the release pass has already run or the registry is disposed, the
	/// resource is released on the caller immediately and `false` is returned.
	pub fn attach_resource(&self, resource: Arc<dyn TopLevelResource>) -> bool {
		if self.is_disposed() {
			tracing::debug!(group = %self.group.name(), resource = resource.name(), "context.resource.late_attach");
			release_one(self.group.name(), resource.as_ref());
			return false;
		}
		self.resources.attach(self.group.name(), resource)
	}

	pub fn resource_count(&self) -> usize {
		self.resources.len()
	}

	pub(crate) fn release_resources(&self) -> ReleaseSummary {
		self.resources.release_all(self.group.name())
	}
}

impl fmt::Display for Registry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Registry[group={}]", self.group.name())
	}
}

impl fmt::Debug for Registry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Registry")
			.field("group", &self.group)
			.field("state", &self.state())
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests;
