use std::fmt;

/// How an execution unit was brought into its group; used for scheduling and observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
	/// Dedicated OS thread owned by the group.
	Thread,
	/// Async task on the shared worker runtime.
	Task,
	/// Caller-owned code registered for the lifetime of a guard.
	Attached,
	/// Event-queue dispatcher of the group.
	Dispatcher,
}

impl UnitKind {
	pub(crate) const fn as_str(self) -> &'static str {
		match self {
			Self::Thread => "thread",
			Self::Task => "task",
			Self::Attached => "attached",
			Self::Dispatcher => "dispatcher",
		}
	}
}

impl fmt::Display for UnitKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
