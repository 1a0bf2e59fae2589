//! Global index from execution groups to registries, and the resolver that walks it.
//!
//! # Invariants
//!
//! - Every map mutation happens under the `entries` write lock. This includes
//!   publication, memoization, unlinking and the `sole`/`main` pointers.
//! - A group maps to its own registry (owned entry) or to the registry of its
//!   nearest materialized ancestor (memoized entry). Owned entries are never
//!   overwritten by memoization.
//! - `sole` is `Some` only while exactly one registry is live and that
//!   registry is bound to a tree root. It is cleared before a second registry
//!   becomes visible.
//! - `epoch` changes whenever the set of owned entries changes. Per-unit
//!   cache entries from an older epoch are ignored.
//! - Memoized entries whose group has been dropped are swept once the map
//!   doubles in size since the last sweep. Owned entries keep their group alive.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwapOption;
use cordon_worker::{EventQueue, EventSink, ExecutionGroup, ExecutionUnit, GroupId, GroupTree, WeakGroup};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::registry::RegistryState;
use crate::{ContextConfig, ContextError, Registry};

static INDEX_IDS: AtomicU64 = AtomicU64::new(1);

const SWEEP_FLOOR: usize = 64;

/// One index slot: the group it is keyed by and the registry it resolves to.
struct Entry {
	group: WeakGroup,
	registry: Arc<Registry>,
}

impl Entry {
	fn new(group: &ExecutionGroup, registry: &Arc<Registry>) -> Self {
		Self {
			group: group.downgrade(),
			registry: Arc::clone(registry),
		}
	}

	/// True if the slot's group owns the registry rather than inheriting it.
	fn is_owned(&self) -> bool {
		self.registry.group().id() == self.group.id()
	}
}

type Entries = FxHashMap<GroupId, Entry>;

/// Per-unit resolution cache entry, stored in the unit's local slot.
struct UnitBinding {
	index: u64,
	epoch: u64,
	registry: Arc<Registry>,
}

/// Result of unlinking a registry's subtree from the index.
pub(crate) struct Unlinked {
	pub groups_removed: usize,
	pub nested: Vec<Arc<Registry>>,
}

/// Concurrent index of registries, keyed by execution group.
pub struct ContextIndex {
	id: u64,
	tree: GroupTree,
	config: ContextConfig,
	entries: RwLock<Entries>,
	sweep_at: AtomicUsize,
	live: AtomicUsize,
	sole: ArcSwapOption<Registry>,
	main: ArcSwapOption<Registry>,
	epoch: AtomicU64,
	probes: AtomicU64,
	init_lock: Mutex<()>,
}

impl ContextIndex {
	pub fn new(tree: GroupTree) -> Self {
		Self::with_config(tree, ContextConfig::default())
	}

	pub fn with_config(tree: GroupTree, config: ContextConfig) -> Self {
		Self {
			id: INDEX_IDS.fetch_add(1, Ordering::Relaxed),
			tree,
			config,
			entries: RwLock::new(FxHashMap::default()),
			sweep_at: AtomicUsize::new(SWEEP_FLOOR),
			live: AtomicUsize::new(0),
			sole: ArcSwapOption::empty(),
			main: ArcSwapOption::empty(),
			epoch: AtomicU64::new(0),
			probes: AtomicU64::new(0),
			init_lock: Mutex::new(()),
		}
	}

	/// Returns the process-wide index over [`GroupTree::global`].
	pub fn global() -> &'static ContextIndex {
		static GLOBAL: OnceLock<ContextIndex> = OnceLock::new();
		GLOBAL.get_or_init(|| ContextIndex::new(GroupTree::global().clone()))
	}

	pub fn tree(&self) -> &GroupTree {
		&self.tree
	}

	pub fn config(&self) -> &ContextConfig {
		&self.config
	}

	/// Number of registries currently owned by some group.
	pub fn live_count(&self) -> usize {
		self.live.load(Ordering::Acquire)
	}

	/// Number of index probes made by tree walks so far.
	pub fn probe_count(&self) -> u64 {
		self.probes.load(Ordering::Relaxed)
	}

	/// Topology generation; changes on every materialization and disposal.
	pub fn epoch(&self) -> u64 {
		self.epoch.load(Ordering::Acquire)
	}

	/// Ensures the tree root owns a registry and returns it.
	///
	/// Safe to call repeatedly and concurrently; every caller gets the same instance.
	pub fn initialize(&self, creator: Option<&ExecutionUnit>) -> Arc<Registry> {
		self.bootstrap(self.tree.root(), creator)
	}

	/// Creates a registry owned by `group`, using a fresh event queue of that group.
	pub fn materialize(&self, group: &ExecutionGroup, creator: Option<&ExecutionUnit>) -> Result<Arc<Registry>, ContextError> {
		self.publish(group, creator, None)
	}

	/// Creates a registry owned by `group` that posts its teardown work to `events`.
	pub fn materialize_with(&self, group: &ExecutionGroup, creator: Option<&ExecutionUnit>, events: Arc<dyn EventSink>) -> Result<Arc<Registry>, ContextError> {
		self.publish(group, creator, Some(events))
	}

	/// Returns the registry for `unit`, or `None` if none is reachable.
	pub fn resolve(&self, unit: &ExecutionUnit) -> Option<Arc<Registry>> {
		match self.try_resolve(unit) {
			Ok(registry) => Some(registry),
			Err(error) => {
				tracing::warn!(unit = %unit.id(), group = %unit.group().name(), %error, "context.resolve.failed");
				None
			}
		}
	}

	/// Returns the registry for `unit`.
	///
	/// Order: the sole-registry fast path, the unit's cached binding, a
	/// bootstrap of the root registry if none is live, then an upward walk
	/// from the unit's group that memoizes every group it passes.
	pub fn try_resolve(&self, unit: &ExecutionUnit) -> Result<Arc<Registry>, ContextError> {
		if let Some(sole) = self.sole_registry() {
			return Ok(sole);
		}

		let mut epoch = self.epoch();
		if let Some(bound) = self.cached(unit, epoch) {
			return Ok(bound);
		}

		let group = unit.group();
		if self.live_count() == 0 {
			self.bootstrap(&group.root(), Some(unit));
			epoch = self.epoch();
		}
		let registry = self.walk(group)?;
		self.remember(unit, epoch, &registry);
		Ok(registry)
	}

	/// Resolves by group alone, skipping the per-unit cache.
	pub fn resolve_group(&self, group: &ExecutionGroup) -> Result<Arc<Registry>, ContextError> {
		if let Some(sole) = self.sole_registry() {
			return Ok(sole);
		}
		if self.live_count() == 0 {
			self.bootstrap(&group.root(), None);
		}
		self.walk(group)
	}

	/// Returns whatever `group` currently maps to, without walking.
	pub fn lookup(&self, group: &ExecutionGroup) -> Option<Arc<Registry>> {
		self.entries.read().get(&group.id()).map(|entry| Arc::clone(&entry.registry))
	}

	/// Snapshot of every live registry.
	pub fn contexts(&self) -> Vec<Arc<Registry>> {
		self.entries
			.read()
			.values()
			.filter(|entry| entry.is_owned())
			.map(|entry| Arc::clone(&entry.registry))
			.collect()
	}

	/// Returns the registry created by the first bootstrap, while it is live.
	pub fn main(&self) -> Option<Arc<Registry>> {
		self.main.load_full()
	}

	pub fn is_main(&self, registry: &Arc<Registry>) -> bool {
		self.main.load_full().is_some_and(|main| Arc::ptr_eq(&main, registry))
	}

	/// Closes the event sink of every registry that is not disposed. Returns how many were closed.
	pub fn shutdown_event_queues(&self) -> usize {
		let mut closed = 0;
		for registry in self.contexts() {
			if registry.state() != RegistryState::Disposed {
				registry.events().close();
				closed += 1;
			}
		}
		tracing::debug!(closed, "context.index.shutdown_event_queues");
		closed
	}

	fn sole_registry(&self) -> Option<Arc<Registry>> {
		let sole = self.sole.load_full()?;
		(self.live_count() == 1 && !sole.is_disposed()).then_some(sole)
	}

	fn cached(&self, unit: &ExecutionUnit, epoch: u64) -> Option<Arc<Registry>> {
		let binding = unit.local().get()?.downcast::<UnitBinding>().ok()?;
		let current = binding.index == self.id && binding.epoch == epoch && !binding.registry.is_disposed();
		current.then(|| Arc::clone(&binding.registry))
	}

	fn remember(&self, unit: &ExecutionUnit, epoch: u64, registry: &Arc<Registry>) {
		unit.local().set(Arc::new(UnitBinding {
			index: self.id,
			epoch,
			registry: Arc::clone(registry),
		}));
	}

	fn bootstrap(&self, root: &ExecutionGroup, creator: Option<&ExecutionUnit>) -> Arc<Registry> {
		let _init = self.init_lock.lock();
		let mut entries = self.entries.write();
		// A racing materialization of `root` wins; adopt its registry.
		if let Some(existing) = entries.get(&root.id()).filter(|entry| entry.is_owned()) {
			return Arc::clone(&existing.registry);
		}
		let registry = self.insert_owned(&mut entries, root, creator, None);
		if self.main.load().is_none() {
			self.main.store(Some(Arc::clone(&registry)));
		}
		drop(entries);
		tracing::debug!(group = %root.name(), "context.index.bootstrap");
		registry
	}

	fn default_sink(&self, group: &ExecutionGroup) -> Arc<dyn EventSink> {
		Arc::new(EventQueue::new(group.clone(), &self.config.event_queue))
	}

	fn publish(&self, group: &ExecutionGroup, creator: Option<&ExecutionUnit>, events: Option<Arc<dyn EventSink>>) -> Result<Arc<Registry>, ContextError> {
		let mut entries = self.entries.write();
		if entries.get(&group.id()).is_some_and(Entry::is_owned) {
			return Err(ContextError::AlreadyMaterialized { group: group.name().to_string() });
		}
		Ok(self.insert_owned(&mut entries, group, creator, events))
	}

	/// Publishes a new registry owned by `group`. The caller holds the write lock
	/// and has checked that `group` owns nothing yet.
	fn insert_owned(&self, entries: &mut Entries, group: &ExecutionGroup, creator: Option<&ExecutionUnit>, events: Option<Arc<dyn EventSink>>) -> Arc<Registry> {
		let events = events.unwrap_or_else(|| self.default_sink(group));
		let registry = Arc::new(Registry::new(group.clone(), snapshot_loader(group, creator), events));

		if self.live.load(Ordering::Acquire) > 0 {
			self.sole.store(None);
		}

		// Memoized descendants that pointed above `group` now resolve to it.
		let descendants: FxHashSet<GroupId> = group.descendants().iter().map(ExecutionGroup::id).collect();
		let before = entries.len();
		entries.retain(|id, entry| !descendants.contains(id) || entry.is_owned() || !entry.registry.group().is_ancestor_of(group));
		let purged = before - entries.len();

		entries.insert(group.id(), Entry::new(group, &registry));
		self.sweep(entries);
		let live = self.live.fetch_add(1, Ordering::AcqRel) + 1;
		if live == 1 && group.is_root() {
			self.sole.store(Some(Arc::clone(&registry)));
		}
		self.epoch.fetch_add(1, Ordering::AcqRel);

		tracing::debug!(group = %group.name(), live, purged, "context.index.materialize");
		registry
	}

	fn walk(&self, start: &ExecutionGroup) -> Result<Arc<Registry>, ContextError> {
		let epoch = self.epoch();
		let mut visited = Vec::new();
		let found = {
			let entries = self.entries.read();
			let mut found = None;
			for group in start.lineage() {
				self.probes.fetch_add(1, Ordering::Relaxed);
				if let Some(entry) = entries.get(&group.id()) {
					found = Some(Arc::clone(&entry.registry));
					break;
				}
				visited.push(group);
			}
			found
		};

		let Some(registry) = found else {
			return Err(ContextError::NotFound { group: start.name().to_string() });
		};

		if !visited.is_empty() {
			let mut entries = self.entries.write();
			if self.epoch() == epoch && !registry.is_disposed() {
				for group in &visited {
					entries.entry(group.id()).or_insert_with(|| Entry::new(group, &registry));
				}
				self.sweep(&mut entries);
			}
		}
		tracing::trace!(group = %start.name(), found = %registry.group().name(), memoized = visited.len(), "context.resolve.walk");
		Ok(registry)
	}

	/// Drops memoized entries of groups that no longer exist, at most once per doubling of the map.
	fn sweep(&self, entries: &mut Entries) {
		if entries.len() < self.sweep_at.load(Ordering::Relaxed) {
			return;
		}
		let before = entries.len();
		entries.retain(|_, entry| entry.group.is_alive());
		self.sweep_at.store((entries.len() * 2).max(SWEEP_FLOOR), Ordering::Relaxed);
		tracing::trace!(swept = before - entries.len(), remaining = entries.len(), "context.index.sweep");
	}

	/// Removes `registry`'s group, its descendants and every entry pointing at
	/// `registry`. Nested registries owned by descendants are returned for retirement.
	pub(crate) fn unlink(&self, registry: &Arc<Registry>) -> Unlinked {
		let group = registry.group();
		let mut doomed: FxHashSet<GroupId> = group.descendants().iter().map(ExecutionGroup::id).collect();
		doomed.insert(group.id());

		let mut entries = self.entries.write();
		let mut nested = Vec::new();
		let before = entries.len();
		entries.retain(|id, entry| {
			let remove = doomed.contains(id) || Arc::ptr_eq(&entry.registry, registry);
			if remove && entry.is_owned() && !Arc::ptr_eq(&entry.registry, registry) {
				nested.push(Arc::clone(&entry.registry));
			}
			!remove
		});
		let groups_removed = before - entries.len();

		for slot in [&self.sole, &self.main] {
			if slot.load_full().is_some_and(|current| Arc::ptr_eq(&current, registry) || nested.iter().any(|n| Arc::ptr_eq(&current, n))) {
				slot.store(None);
			}
		}
		self.epoch.fetch_add(1, Ordering::AcqRel);
		Unlinked { groups_removed, nested }
	}

	/// Drops one live registry from the count.
	pub(crate) fn release_slot(&self) -> usize {
		let previous = self.live.fetch_sub(1, Ordering::AcqRel);
		previous.saturating_sub(1)
	}
}

impl std::fmt::Debug for ContextIndex {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ContextIndex")
			.field("id", &self.id)
			.field("root", &self.tree.root().name())
			.field("live", &self.live_count())
			.field("epoch", &self.epoch())
			.finish_non_exhaustive()
	}
}

fn snapshot_loader(group: &ExecutionGroup, creator: Option<&ExecutionUnit>) -> Option<cordon_worker::Loader> {
	creator.and_then(|unit| unit.loader().cloned()).or_else(|| group.loader())
}
