//! One-entry most-recently-used cache.
//!
//! Two slots alternate as "active" and "shadow". A miss writes the new pair
//! into the shadow slot and flips the active index, so the hit path never
//! allocates and the miss path only bumps reference counts. The pair is not
//! synchronized on its own; it lives inside the registry's table lock.

use crate::{ContextKey, Value};

#[derive(Default)]
struct RecentEntry {
	key: Option<ContextKey>,
	value: Option<Value>,
}

#[derive(Default)]
pub(crate) struct RecentPair {
	slots: [RecentEntry; 2],
	active: usize,
}

impl RecentPair {
	/// Returns `Some(cached)` when `key` is the active slot's key.
	///
	/// A hit may carry `None`: the last lookup for this key found nothing.
	#[inline]
	pub fn lookup(&self, key: &ContextKey) -> Option<Option<Value>> {
		let slot = &self.slots[self.active];
		match &slot.key {
			Some(cached) if cached == key => Some(slot.value.clone()),
			_ => None,
		}
	}

	/// Installs `(key, value)` into the shadow slot and makes it active.
	pub fn install(&mut self, key: &ContextKey, value: Option<Value>) {
		let shadow = self.active ^ 1;
		let slot = &mut self.slots[shadow];
		slot.key = Some(key.clone());
		slot.value = value;
		self.active = shadow;
	}

	/// Rewrites the cached value if `key` is the active key.
	pub fn refresh(&mut self, key: &ContextKey, value: Option<Value>) {
		let slot = &mut self.slots[self.active];
		if slot.key.as_ref() == Some(key) {
			slot.value = value;
		}
	}

	/// Empties both slots.
	pub fn reset(&mut self) {
		self.slots = Default::default();
		self.active = 0;
	}

	#[cfg(test)]
	fn active_index(&self) -> usize {
		self.active
	}
}
