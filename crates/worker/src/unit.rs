use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::panic::join_error_panic_message;
use crate::token::{IdClock, InterruptToken};
use crate::{ExecutionGroup, UnitKind};

static UNIT_IDS: IdClock = IdClock::new();

/// Opaque capability snapshot carried by groups and units.
///
/// Units inherit their group's loader at creation; consumers treat it as an
/// identity-only token and never inspect it.
pub type Loader = Arc<dyn Any + Send + Sync>;

/// Process-unique identity of one execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u64);

impl UnitId {
	pub const fn as_u64(self) -> u64 {
		self.0
	}
}

impl fmt::Display for UnitId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "unit#{}", self.0)
	}
}

/// Type-erased per-unit storage slot.
///
/// Higher layers park one value here (for example a resolved context) so
/// repeated lookups from the same unit avoid shared state.
#[derive(Default)]
pub struct UnitLocal {
	slot: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl UnitLocal {
	pub fn get(&self) -> Option<Arc<dyn Any + Send + Sync>> {
		self.slot.lock().clone()
	}

	pub fn set(&self, value: Arc<dyn Any + Send + Sync>) {
		*self.slot.lock() = Some(value);
	}

	pub fn take(&self) -> Option<Arc<dyn Any + Send + Sync>> {
		self.slot.lock().take()
	}
}

struct UnitInner {
	id: UnitId,
	name: String,
	kind: UnitKind,
	group: ExecutionGroup,
	interrupt: InterruptToken,
	loader: Option<Loader>,
	local: UnitLocal,
}

/// Handle to one execution unit: a thread, task or attached caller that belongs to a group.
#[derive(Clone)]
pub struct ExecutionUnit {
	inner: Arc<UnitInner>,
}

impl ExecutionUnit {
	pub(crate) fn new(group: &ExecutionGroup, name: String, kind: UnitKind) -> Self {
		Self {
			inner: Arc::new(UnitInner {
				id: UnitId(UNIT_IDS.next()),
				name,
				kind,
				group: group.clone(),
				interrupt: InterruptToken::new(),
				loader: group.loader(),
				local: UnitLocal::default(),
			}),
		}
	}

	pub fn id(&self) -> UnitId {
		self.inner.id
	}

	pub fn name(&self) -> &str {
		&self.inner.name
	}

	pub fn kind(&self) -> UnitKind {
		self.inner.kind
	}

	/// Returns the group this unit belongs to.
	pub fn group(&self) -> &ExecutionGroup {
		&self.inner.group
	}

	/// Returns the loader snapshot taken from the group when the unit was created.
	pub fn loader(&self) -> Option<&Loader> {
		self.inner.loader.as_ref()
	}

	/// Requests a cooperative interrupt.
	pub fn interrupt(&self) {
		self.inner.interrupt.interrupt();
	}

	pub fn is_interrupted(&self) -> bool {
		self.inner.interrupt.is_interrupted()
	}

	/// Returns the unit-local slot.
	pub fn local(&self) -> &UnitLocal {
		&self.inner.local
	}

	pub(crate) fn token(&self) -> &InterruptToken {
		&self.inner.interrupt
	}
}

impl PartialEq for ExecutionUnit {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}
}

impl Eq for ExecutionUnit {}

impl std::hash::Hash for ExecutionUnit {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.inner.id.hash(state);
	}
}

impl fmt::Debug for ExecutionUnit {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ExecutionUnit")
			.field("id", &self.inner.id)
			.field("name", &self.inner.name)
			.field("kind", &self.inner.kind)
			.field("group", &self.inner.group.name())
			.finish()
	}
}

/// Returned by interrupt-aware waits once the unit has been interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("execution unit was interrupted")]
pub struct Interrupted;

/// View of the running unit handed to unit bodies.
#[derive(Debug, Clone)]
pub struct UnitContext {
	unit: ExecutionUnit,
}

impl UnitContext {
	pub(crate) fn new(unit: ExecutionUnit) -> Self {
		Self { unit }
	}

	pub fn unit(&self) -> &ExecutionUnit {
		&self.unit
	}

	pub fn group(&self) -> &ExecutionGroup {
		self.unit.group()
	}

	pub fn is_interrupted(&self) -> bool {
		self.unit.is_interrupted()
	}

	/// Returns `Err(Interrupted)` once an interrupt has been requested.
	pub fn check(&self) -> Result<(), Interrupted> {
		if self.is_interrupted() { Err(Interrupted) } else { Ok(()) }
	}

	/// Future resolving when the unit is interrupted.
	pub async fn interrupted(&self) {
		self.unit.token().interrupted().await;
	}

	/// Blocks the calling thread for `duration`, returning early on interrupt.
	///
	/// # Panics
	///
	/// Panics when called from inside an async runtime; async bodies should
	/// race [`Self::interrupted`] against their own timers instead.
	pub fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
		self.check()?;
		let token = self.unit.token().clone();
		crate::spawn::runtime_handle().block_on(async move {
			tokio::select! {
				_ = token.interrupted() => Err(Interrupted),
				_ = tokio::time::sleep(duration) => Ok(()),
			}
		})
	}
}

/// Keeps a unit in its group's live table until dropped.
pub(crate) struct Registration {
	unit: ExecutionUnit,
}

impl Registration {
	pub(crate) fn new(unit: ExecutionUnit) -> Self {
		unit.group().units().insert(unit.clone());
		tracing::trace!(unit = %unit.id(), group = %unit.group().name(), unit_kind = unit.kind().as_str(), "worker.unit.enter");
		Self { unit }
	}

	pub(crate) fn unit(&self) -> &ExecutionUnit {
		&self.unit
	}
}

impl Drop for Registration {
	fn drop(&mut self) {
		self.unit.group().units().remove(self.unit.id());
		tracing::trace!(unit = %self.unit.id(), group = %self.unit.group().name(), "worker.unit.exit");
	}
}

/// Caller-owned unit membership; the unit leaves its group when the guard drops.
pub struct UnitGuard {
	registration: Registration,
}

impl UnitGuard {
	pub(crate) fn new(registration: Registration) -> Self {
		Self { registration }
	}

	/// Returns a context view for the attached unit.
	pub fn context(&self) -> UnitContext {
		UnitContext::new(self.registration.unit().clone())
	}
}

impl Deref for UnitGuard {
	type Target = ExecutionUnit;

	fn deref(&self) -> &ExecutionUnit {
		self.registration.unit()
	}
}

impl fmt::Debug for UnitGuard {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("UnitGuard").field(self.registration.unit()).finish()
	}
}

/// Unit running on a dedicated OS thread.
#[derive(Debug)]
pub struct ThreadUnit<R> {
	pub(crate) unit: ExecutionUnit,
	pub(crate) handle: std::thread::JoinHandle<R>,
}

impl<R> ThreadUnit<R> {
	pub fn unit(&self) -> &ExecutionUnit {
		&self.unit
	}

	pub fn is_finished(&self) -> bool {
		self.handle.is_finished()
	}

	/// Waits for the thread to exit.
	pub fn join(self) -> std::thread::Result<R> {
		self.handle.join()
	}
}

/// Failure joining a task unit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitJoinError {
	#[error("unit panicked: {0}")]
	Panicked(String),
	#[error("unit was cancelled")]
	Cancelled,
}

/// Unit running as an async task on the worker runtime.
#[derive(Debug)]
pub struct TaskUnit<T> {
	pub(crate) unit: ExecutionUnit,
	pub(crate) handle: JoinHandle<T>,
}

impl<T> TaskUnit<T> {
	pub fn unit(&self) -> &ExecutionUnit {
		&self.unit
	}

	pub fn is_finished(&self) -> bool {
		self.handle.is_finished()
	}

	/// Cancels the task at its next await point.
	pub fn abort(&self) {
		self.handle.abort();
	}

	/// Waits for the task to complete.
	pub async fn join(self) -> Result<T, UnitJoinError> {
		match self.handle.await {
			Ok(value) => Ok(value),
			Err(err) if err.is_cancelled() => Err(UnitJoinError::Cancelled),
			Err(err) => Err(UnitJoinError::Panicked(join_error_panic_message(err).unwrap_or_else(|| "<unknown panic>".to_string()))),
		}
	}
}
