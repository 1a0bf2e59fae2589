//! Top-level resources released when a registry's group is disposed.

use std::sync::Arc;

use cordon_worker::panic_message;
use parking_lot::Mutex;

/// An externally visible resource owned by a group, such as a window or a tray entry.
pub trait TopLevelResource: Send + Sync {
	fn name(&self) -> &str;

	/// Releases the resource. Called at most once, on a unit of the owning group.
	fn release(&self) -> Result<(), String>;
}

/// Tally of one release pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseSummary {
	pub released: usize,
	pub failed: usize,
}

#[derive(Default)]
struct ResourceState {
	entries: Vec<Arc<dyn TopLevelResource>>,
	drained: bool,
}

#[derive(Default)]
pub(crate) struct ResourceSet {
	state: Mutex<ResourceState>,
}

impl ResourceSet {
	/// Adds a resource to the next release pass. Once a pass has run, the
	/// resource is released on the caller right away. Returns `false` in that case.
	pub fn attach(&self, owner: &str, resource: Arc<dyn TopLevelResource>) -> bool {
		let mut state = self.state.lock();
		if !state.drained {
			state.entries.push(resource);
			return true;
		}
		drop(state);
		tracing::debug!(group = owner, resource = resource.name(), "context.resource.late_attach");
		release_one(owner, resource.as_ref());
		false
	}

	pub fn len(&self) -> usize {
		self.state.lock().entries.len()
	}

	/// Takes every attached resource and releases each one in attach order.
	///
	/// Failures and panics are logged per resource; the pass always completes.
	pub fn release_all(&self, owner: &str) -> ReleaseSummary {
		let resources = {
			let mut state = self.state.lock();
			state.drained = true;
			std::mem::take(&mut state.entries)
		};
		let mut summary = ReleaseSummary::default();
		for resource in resources {
			if release_one(owner, resource.as_ref()) {
				summary.released += 1;
			} else {
				summary.failed += 1;
			}
		}
		summary
	}
}

/// Releases one resource, logging a failure or panic. Returns true on success.
pub(crate) fn release_one(owner: &str, resource: &dyn TopLevelResource) -> bool {
	match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| resource.release())) {
		Ok(Ok(())) => true,
		Ok(Err(error)) => {
			tracing::warn!(group = owner, resource = resource.name(), %error, "context.resource.release_failed");
			false
		}
		Err(payload) => {
			tracing::warn!(group = owner, resource = resource.name(), panic = %panic_message(payload.as_ref()), "context.resource.release_panicked");
			false
		}
	}
}
