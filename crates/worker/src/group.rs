//! Execution-group tree.
//!
//! Groups form a single-rooted tree with strong parent links and weak child
//! links: a group lives as long as someone holds a handle to it or one of
//! its units is still running.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::registry::{UnitRecord, UnitTable};
use crate::spawn::{spawn_named_thread, spawn_task};
use crate::token::IdClock;
use crate::unit::{Loader, Registration, TaskUnit, ThreadUnit, UnitContext, UnitGuard};
use crate::{ExecutionUnit, UnitKind};

static GROUP_IDS: IdClock = IdClock::new();

/// Process-unique identity of one execution group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(u64);

impl GroupId {
	pub const fn as_u64(self) -> u64 {
		self.0
	}
}

impl fmt::Display for GroupId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "group#{}", self.0)
	}
}

/// Failure to start a unit.
#[derive(Debug, Error)]
pub enum SpawnError {
	#[error("failed to spawn unit thread '{name}': {source}")]
	Thread {
		name: String,
		#[source]
		source: std::io::Error,
	},
}

struct GroupInner {
	id: GroupId,
	name: String,
	parent: Option<ExecutionGroup>,
	children: Mutex<Vec<Weak<GroupInner>>>,
	units: UnitTable,
	loader: RwLock<Option<Loader>>,
}

/// Handle to one node of the execution-group tree.
#[derive(Clone)]
pub struct ExecutionGroup {
	inner: Arc<GroupInner>,
}

impl ExecutionGroup {
	fn new(name: String, parent: Option<ExecutionGroup>, loader: Option<Loader>) -> Self {
		Self {
			inner: Arc::new(GroupInner {
				id: GroupId(GROUP_IDS.next()),
				name,
				parent,
				children: Mutex::new(Vec::new()),
				units: UnitTable::default(),
				loader: RwLock::new(loader),
			}),
		}
	}

	/// Creates a child group. The child starts with this group's loader.
	pub fn new_child(&self, name: impl Into<String>) -> ExecutionGroup {
		let child = Self::new(name.into(), Some(self.clone()), self.loader());
		let mut children = self.inner.children.lock();
		children.retain(|weak| weak.strong_count() > 0);
		children.push(Arc::downgrade(&child.inner));
		drop(children);
		tracing::trace!(group = %child.inner.name, parent = %self.inner.name, "worker.group.create");
		child
	}

	pub fn id(&self) -> GroupId {
		self.inner.id
	}

	/// Returns a handle that does not keep this group alive.
	pub fn downgrade(&self) -> WeakGroup {
		WeakGroup {
			id: self.inner.id,
			inner: Arc::downgrade(&self.inner),
		}
	}

	pub fn name(&self) -> &str {
		&self.inner.name
	}

	pub fn parent(&self) -> Option<ExecutionGroup> {
		self.inner.parent.clone()
	}

	pub fn is_root(&self) -> bool {
		self.inner.parent.is_none()
	}

	/// Returns the top of this group's tree.
	pub fn root(&self) -> ExecutionGroup {
		let mut cursor = self.clone();
		while let Some(parent) = cursor.parent() {
			cursor = parent;
		}
		cursor
	}

	/// Iterates this group followed by each of its ancestors up to the root.
	pub fn lineage(&self) -> impl Iterator<Item = ExecutionGroup> + use<> {
		std::iter::successors(Some(self.clone()), ExecutionGroup::parent)
	}

	/// Returns the live direct children.
	pub fn children(&self) -> Vec<ExecutionGroup> {
		self.inner
			.children
			.lock()
			.iter()
			.filter_map(Weak::upgrade)
			.map(|inner| ExecutionGroup { inner })
			.collect()
	}

	/// Returns every live descendant in pre-order, excluding `self`.
	pub fn descendants(&self) -> Vec<ExecutionGroup> {
		let mut out = Vec::new();
		let mut stack = self.children();
		stack.reverse();
		while let Some(group) = stack.pop() {
			let mut children = group.children();
			children.reverse();
			stack.extend(children);
			out.push(group);
		}
		out
	}

	/// Returns true if `self` is `other` or one of its ancestors.
	pub fn is_ancestor_of(&self, other: &ExecutionGroup) -> bool {
		other.lineage().any(|group| group == *self)
	}

	/// Returns the units running directly in this group.
	pub fn live_units(&self) -> Vec<ExecutionUnit> {
		self.inner.units.units()
	}

	/// Counts live units in this group and all of its descendants.
	pub fn live_unit_count(&self) -> usize {
		self.inner.units.len() + self.descendants().iter().map(|group| group.inner.units.len()).sum::<usize>()
	}

	/// Returns snapshots of live units in this group and all of its descendants.
	pub fn unit_records(&self) -> Vec<UnitRecord> {
		let mut records = self.inner.units.records();
		for group in self.descendants() {
			records.extend(group.inner.units.records());
		}
		records
	}

	/// Interrupts every live unit in this group and all of its descendants.
	pub fn interrupt_all(&self) -> usize {
		let mut interrupted = self.inner.units.interrupt_all();
		for group in self.descendants() {
			interrupted += group.inner.units.interrupt_all();
		}
		tracing::debug!(group = %self.inner.name, interrupted, "worker.group.interrupt_all");
		interrupted
	}

	pub fn loader(&self) -> Option<Loader> {
		self.inner.loader.read().clone()
	}

	/// Replaces the loader handed to units created from now on.
	pub fn set_loader(&self, loader: Option<Loader>) {
		*self.inner.loader.write() = loader;
	}

	/// Registers the caller's own code as a unit of this group until the guard drops.
	pub fn attach(&self, name: impl Into<String>) -> UnitGuard {
		let unit = ExecutionUnit::new(self, name.into(), UnitKind::Attached);
		UnitGuard::new(Registration::new(unit))
	}

	/// Runs `f` on a dedicated OS thread that belongs to this group.
	pub fn spawn_thread<F, R>(&self, name: impl Into<String>, f: F) -> Result<ThreadUnit<R>, SpawnError>
	where
		F: FnOnce(UnitContext) -> R + Send + 'static,
		R: Send + 'static,
	{
		let name = name.into();
		let unit = ExecutionUnit::new(self, name.clone(), UnitKind::Thread);
		let registration = Registration::new(unit.clone());
		let ctx = UnitContext::new(unit.clone());
		let thread_name = format!("{}/{}", self.inner.name, name);
		let handle = spawn_named_thread(UnitKind::Thread, thread_name, move || {
			let _registration = registration;
			f(ctx)
		})
		.map_err(|source| SpawnError::Thread { name, source })?;
		Ok(ThreadUnit { unit, handle })
	}

	/// Runs the future built by `f` as an async task that belongs to this group.
	pub fn spawn_task<F, Fut>(&self, name: impl Into<String>, f: F) -> TaskUnit<Fut::Output>
	where
		F: FnOnce(UnitContext) -> Fut,
		Fut: Future + Send + 'static,
		Fut::Output: Send + 'static,
	{
		self.spawn_task_as(UnitKind::Task, name.into(), f)
	}

	pub(crate) fn spawn_task_as<F, Fut>(&self, kind: UnitKind, name: String, f: F) -> TaskUnit<Fut::Output>
	where
		F: FnOnce(UnitContext) -> Fut,
		Fut: Future + Send + 'static,
		Fut::Output: Send + 'static,
	{
		let unit = ExecutionUnit::new(self, name, kind);
		let registration = Registration::new(unit.clone());
		let fut = f(UnitContext::new(unit.clone()));
		let handle = spawn_task(kind, async move {
			let _registration = registration;
			fut.await
		});
		TaskUnit { unit, handle }
	}

	pub(crate) fn units(&self) -> &UnitTable {
		&self.inner.units
	}
}

impl PartialEq for ExecutionGroup {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}
}

impl Eq for ExecutionGroup {}

impl std::hash::Hash for ExecutionGroup {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.inner.id.hash(state);
	}
}

impl fmt::Debug for ExecutionGroup {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ExecutionGroup")
			.field("id", &self.inner.id)
			.field("name", &self.inner.name)
			.finish()
	}
}

impl fmt::Display for ExecutionGroup {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.inner.name)
	}
}

/// Non-owning handle to an execution group.
#[derive(Clone)]
pub struct WeakGroup {
	id: GroupId,
	inner: Weak<GroupInner>,
}

impl WeakGroup {
	pub fn id(&self) -> GroupId {
		self.id
	}

	pub fn upgrade(&self) -> Option<ExecutionGroup> {
		self.inner.upgrade().map(|inner| ExecutionGroup { inner })
	}

	/// Returns false once every strong handle to the group is gone.
	pub fn is_alive(&self) -> bool {
		self.inner.strong_count() > 0
	}
}

impl fmt::Debug for WeakGroup {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WeakGroup").field("id", &self.id).field("alive", &self.is_alive()).finish()
	}
}

/// A single-rooted tree of execution groups.
#[derive(Debug, Clone)]
pub struct GroupTree {
	root: ExecutionGroup,
}

impl Default for GroupTree {
	fn default() -> Self {
		Self::new()
	}
}

impl GroupTree {
	/// Creates a tree whose root group is named `system`.
	pub fn new() -> Self {
		Self::with_root_name("system")
	}

	pub fn with_root_name(name: impl Into<String>) -> Self {
		Self {
			root: ExecutionGroup::new(name.into(), None, None),
		}
	}

	/// Returns the process-wide tree.
	pub fn global() -> &'static GroupTree {
		static GLOBAL: OnceLock<GroupTree> = OnceLock::new();
		GLOBAL.get_or_init(GroupTree::new)
	}

	pub fn root(&self) -> &ExecutionGroup {
		&self.root
	}

	/// Returns true if `group` belongs to this tree.
	pub fn contains(&self, group: &ExecutionGroup) -> bool {
		group.root() == self.root
	}
}
