// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

use std::collections::BTreeMap;

use parking_lot::Mutex;
use veradb_cdc::{StateRow, StateRowKey, StateTable};
use veradb_core::Result;

/// State table backed by a sorted in-memory map.
#[derive(Default)]
pub struct MemoryStateTable {
	rows: Mutex<BTreeMap<StateRowKey, StateRow>>,
}

impl MemoryStateTable {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.rows.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.rows.lock().is_empty()
	}

	/// Direct row access for assertions.
	pub fn row(&self, key: &StateRowKey) -> Option<StateRow> {
		self.rows.lock().get(key).cloned()
	}

	/// Seeds a row without going through the service.
	pub fn put(&self, row: StateRow) {
		self.rows.lock().insert(row.key.clone(), row);
	}
}

impl StateTable for MemoryStateTable {
	fn scan(&self) -> Result<Vec<StateRow>> {
		Ok(self.rows.lock().values().cloned().collect())
	}

	fn fetch(&self, key: &StateRowKey) -> Result<Option<StateRow>> {
		Ok(self.rows.lock().get(key).cloned())
	}

	fn insert(&self, row: StateRow) -> Result<()> {
		self.rows.lock().insert(row.key.clone(), row);
		Ok(())
	}

	fn update(&self, row: StateRow) -> Result<bool> {
		let mut rows = self.rows.lock();
		if !rows.contains_key(&row.key) {
			return Ok(false);
		}
		rows.insert(row.key.clone(), row);
		Ok(true)
	}

	fn delete(&self, key: &StateRowKey) -> Result<bool> {
		Ok(self.rows.lock().remove(key).is_some())
	}
}
