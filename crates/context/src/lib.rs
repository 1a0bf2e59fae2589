//! Execution-scoped hierarchical registries.
//!
//! Each materialized [`ExecutionGroup`](cordon_worker::ExecutionGroup) owns a
//! private [`Registry`] of shared values. Units resolve "their" registry
//! through a [`ContextIndex`], which walks the group tree upward to the nearest
//! materialized ancestor and memoizes the path. When a group's lifetime ends,
//! [`ContextIndex::dispose`] tears its registry down in bounded phases.
//!
//! ```no_run
//! # async fn demo() -> Result<(), cordon_context::ContextError> {
//! use cordon_context::{ContextIndex, TypedKey};
//! use cordon_worker::GroupTree;
//!
//! let tree = GroupTree::new();
//! let index = ContextIndex::new(tree.clone());
//! let app = tree.root().new_child("app");
//! index.materialize(&app, None)?;
//!
//! let unit = app.attach("request");
//! let registry = index.try_resolve(&unit)?;
//! let greeting = TypedKey::<String>::new("greeting");
//! registry.put_typed(&greeting, "hello".to_string());
//!
//! let admin = tree.root().attach("admin");
//! drop(unit);
//! index.dispose(&registry, &admin).await?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod config;
mod dispose;
mod error;
mod index;
mod key;
mod lifecycle;
mod registry;
mod resources;
#[cfg(test)]
mod testing;

pub use config::ContextConfig;
pub use dispose::{DisposalReport, DisposeOutcome};
pub use error::ContextError;
pub use index::ContextIndex;
pub use key::{ContextKey, TypedKey, Value};
pub use lifecycle::{LifecycleChange, LifecycleEvent, LifecycleListener};
pub use registry::{Registry, RegistryState, RegistryStats};
pub use resources::{ReleaseSummary, TopLevelResource};
