//! Tunables for resolution and disposal.

use std::time::Duration;

use cordon_worker::EventQueueSpec;
use serde::{Deserialize, Serialize};

use crate::ContextError;

/// Configuration shared by every registry of one [`ContextIndex`](crate::ContextIndex).
///
/// Loadable from TOML:
///
/// ```toml
/// disposal_timeout_ms = 5000
/// interrupt_timeout_ms = 1000
/// interrupt_poll_ms = 10
///
/// [event_queue]
/// capacity = 1024
/// overflow = "reject"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextConfig {
	/// Upper bound on each event-queue wait during disposal.
	pub disposal_timeout_ms: u64,
	/// Upper bound on waiting for interrupted units to exit.
	pub interrupt_timeout_ms: u64,
	/// Poll interval while waiting for interrupted units.
	pub interrupt_poll_ms: u64,
	/// Event queue created for each registry that is not given its own sink.
	pub event_queue: EventQueueSpec,
}

impl Default for ContextConfig {
	fn default() -> Self {
		Self {
			disposal_timeout_ms: 5_000,
			interrupt_timeout_ms: 1_000,
			interrupt_poll_ms: 10,
			event_queue: EventQueueSpec::default(),
		}
	}
}

impl ContextConfig {
	/// Parses a configuration from TOML. Missing fields take their defaults.
	pub fn from_toml_str(text: &str) -> Result<Self, ContextError> {
		let config: Self = toml::from_str(text).map_err(|e| ContextError::Config(e.to_string()))?;
		if config.event_queue.capacity == 0 {
			return Err(ContextError::Config("event_queue.capacity must be > 0".to_string()));
		}
		Ok(config)
	}

	#[must_use]
	pub fn with_disposal_timeout(mut self, timeout: Duration) -> Self {
		self.disposal_timeout_ms = duration_ms(timeout);
		self
	}

	#[must_use]
	pub fn with_interrupt_timeout(mut self, timeout: Duration) -> Self {
		self.interrupt_timeout_ms = duration_ms(timeout);
		self
	}

	#[must_use]
	pub fn with_interrupt_poll(mut self, poll: Duration) -> Self {
		self.interrupt_poll_ms = duration_ms(poll);
		self
	}

	#[must_use]
	pub fn with_event_queue(mut self, spec: EventQueueSpec) -> Self {
		self.event_queue = spec;
		self
	}

	pub fn disposal_timeout(&self) -> Duration {
		Duration::from_millis(self.disposal_timeout_ms)
	}

	pub fn interrupt_timeout(&self) -> Duration {
		Duration::from_millis(self.interrupt_timeout_ms)
	}

	/// Poll interval, never shorter than one millisecond.
	pub fn interrupt_poll(&self) -> Duration {
		Duration::from_millis(self.interrupt_poll_ms.max(1))
	}
}

fn duration_ms(duration: Duration) -> u64 {
	u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
