//! Execution groups, execution units and per-group event queues.
//!
//! This crate supplies the collaborators a scoped registry needs:
//! - [`GroupTree`] / [`ExecutionGroup`]: a single-rooted tree of isolation groups
//! - [`ExecutionUnit`]: a thread, task or attached caller that belongs to one group
//! - [`EventQueue`]: a FIFO task queue drained by a dispatcher unit of its group

mod class;
mod group;
mod mailbox;
mod panic;
mod queue;
mod registry;
mod spawn;
mod token;
mod unit;

pub use class::UnitKind;
pub use group::{ExecutionGroup, GroupId, GroupTree, SpawnError, WeakGroup};
pub use mailbox::OverflowPolicy;
pub use panic::{join_error_panic_message, panic_message};
pub use queue::{EventQueue, EventQueueSpec, EventSink, EventTask, PostError};
pub use registry::UnitRecord;
pub use unit::{ExecutionUnit, Interrupted, Loader, TaskUnit, ThreadUnit, UnitContext, UnitGuard, UnitId, UnitJoinError, UnitLocal};
