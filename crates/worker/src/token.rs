use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

/// Monotonic identifier clock for groups and units.
#[derive(Debug)]
pub(crate) struct IdClock {
	next: AtomicU64,
}

impl IdClock {
	/// Creates a clock whose first issued ID is 1.
	pub const fn new() -> Self {
		Self { next: AtomicU64::new(0) }
	}

	/// Returns the next ID.
	pub fn next(&self) -> u64 {
		self.next.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
	}
}

/// Interrupt flag shared between an execution unit and whoever may stop it.
///
/// Interrupts are cooperative: units observe them through [`UnitContext`](crate::UnitContext)
/// and are expected to wind down on their own.
#[derive(Debug, Clone, Default)]
pub(crate) struct InterruptToken {
	cancel: CancellationToken,
}

impl InterruptToken {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns true once an interrupt has been requested.
	pub fn is_interrupted(&self) -> bool {
		self.cancel.is_cancelled()
	}

	/// Requests an interrupt. Idempotent.
	pub fn interrupt(&self) {
		self.cancel.cancel();
	}

	/// Future resolving when an interrupt is requested.
	pub async fn interrupted(&self) {
		self.cancel.cancelled().await;
	}
}
