use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::{ExecutionUnit, UnitId, UnitKind};

/// Snapshot of one live execution unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRecord {
	pub id: UnitId,
	pub name: String,
	pub kind: UnitKind,
	pub interrupted: bool,
}

/// Live-unit table owned by one execution group.
#[derive(Default)]
pub(crate) struct UnitTable {
	inner: Mutex<FxHashMap<UnitId, ExecutionUnit>>,
}

impl UnitTable {
	/// Inserts one unit.
	pub fn insert(&self, unit: ExecutionUnit) {
		self.inner.lock().insert(unit.id(), unit);
	}

	/// Removes one unit, returning whether it was present.
	pub fn remove(&self, id: UnitId) -> bool {
		self.inner.lock().remove(&id).is_some()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().len()
	}

	/// Returns unit handles sorted by ID.
	pub fn units(&self) -> Vec<ExecutionUnit> {
		let mut units: Vec<_> = self.inner.lock().values().cloned().collect();
		units.sort_by_key(ExecutionUnit::id);
		units
	}

	/// Returns snapshots sorted by ID.
	pub fn records(&self) -> Vec<UnitRecord> {
		self.units()
			.into_iter()
			.map(|unit| UnitRecord {
				id: unit.id(),
				name: unit.name().to_string(),
				kind: unit.kind(),
				interrupted: unit.is_interrupted(),
			})
			.collect()
	}

	/// Interrupts every unit currently in the table.
	pub fn interrupt_all(&self) -> usize {
		let units = self.units();
		for unit in &units {
			unit.interrupt();
		}
		units.len()
	}
}
