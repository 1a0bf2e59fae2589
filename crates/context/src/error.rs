//! Error types for registry operations.

use thiserror::Error;

/// Errors surfaced by registries, resolution and disposal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
	/// A required argument was absent.
	#[error("invalid argument: {0}")]
	InvalidArgument(&'static str),
	/// The operation is not allowed from the caller's position.
	#[error("illegal state: {0}")]
	IllegalState(String),
	/// No registry is reachable from the group.
	#[error("no registry reachable from group '{group}'")]
	NotFound {
		/// Name of the group the walk started from.
		group: String,
	},
	/// The group already owns a registry.
	#[error("group '{group}' already owns a registry")]
	AlreadyMaterialized {
		/// Name of the group.
		group: String,
	},
	/// The configuration could not be parsed.
	#[error("invalid configuration: {0}")]
	Config(String),
}
