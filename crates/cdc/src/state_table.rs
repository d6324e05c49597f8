// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

//! Client-side view of the persisted CDC state table.
//!
//! One row per (tablet, stream) pair records the durable consumer
//! position. The storage behind the table is out of scope; the
//! [`StateTable`] trait is implemented over whatever keyed system
//! table the deployment provides.

use std::{collections::BTreeMap, str::FromStr};

use serde::{Deserialize, Serialize};
use veradb_core::{CdcError, HybridTime, OpId, Result, StreamId, TableId, TabletId};

/// Well-known keys inside a row's `data` map.
pub const ACTIVE_TIME_KEY: &str = "active_time";
pub const SAFE_TIME_KEY: &str = "cdc_sdk_safe_time";
pub const SNAPSHOT_KEY: &str = "snapshot_key";

/// Primary key of a state table row.
///
/// `stream_key` is the stream id, or `"{stream_id}_{table_id}"` for a
/// colocated table. Stream ids never contain underscores, so the
/// colocated form is recognizable by inspection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateRowKey {
	pub tablet_id: TabletId,
	pub stream_key: String,
}

impl StateRowKey {
	pub fn new(tablet_id: TabletId, stream_id: &StreamId) -> Self {
		Self {
			tablet_id,
			stream_key: stream_id.0.clone(),
		}
	}

	pub fn colocated(tablet_id: TabletId, stream_id: &StreamId, table_id: &TableId) -> Self {
		Self {
			tablet_id,
			stream_key: format!("{}_{}", stream_id, table_id),
		}
	}

	pub fn is_colocated(&self) -> bool {
		self.stream_key.contains('_')
	}

	/// Splits the stream key back into stream id and optional
	/// colocated table id.
	pub fn parse_stream(&self) -> (StreamId, Option<TableId>) {
		match self.stream_key.split_once('_') {
			Some((stream, table)) => (StreamId::from(stream), Some(TableId::from(table))),
			None => (StreamId::from(self.stream_key.as_str()), None),
		}
	}
}

/// One persisted (tablet, stream) position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRow {
	pub key: StateRowKey,
	/// Checkpoint in [`OpId`] display form. [`OpId::MAX`] marks the
	/// pair fully consumed and eligible for deletion.
	pub checkpoint: String,
	/// Wall-clock micros of the last successful poll; `None` means
	/// the pair was never polled.
	pub last_replication_time: Option<u64>,
	pub data: BTreeMap<String, String>,
}

impl StateRow {
	pub fn new(key: StateRowKey, checkpoint: OpId) -> Self {
		Self {
			key,
			checkpoint: checkpoint.to_string(),
			last_replication_time: None,
			data: BTreeMap::new(),
		}
	}

	pub fn checkpoint_op_id(&self) -> Result<OpId> {
		OpId::from_str(&self.checkpoint).map_err(|e| CdcError::state_table(e.to_string()))
	}

	pub fn set_checkpoint(&mut self, op_id: OpId) {
		self.checkpoint = op_id.to_string();
	}

	pub fn active_time(&self) -> Option<u64> {
		self.data.get(ACTIVE_TIME_KEY).and_then(|v| v.parse().ok())
	}

	pub fn set_active_time(&mut self, micros: u64) {
		self.data.insert(ACTIVE_TIME_KEY.to_string(), micros.to_string());
	}

	pub fn safe_time(&self) -> Option<HybridTime> {
		self.data.get(SAFE_TIME_KEY).and_then(|v| v.parse().ok()).map(HybridTime)
	}

	pub fn set_safe_time(&mut self, safe_time: HybridTime) {
		self.data.insert(SAFE_TIME_KEY.to_string(), safe_time.0.to_string());
	}

	pub fn snapshot_key(&self) -> Option<&str> {
		self.data.get(SNAPSHOT_KEY).map(String::as_str)
	}

	pub fn set_snapshot_key(&mut self, key: Option<&str>) {
		match key {
			Some(k) => {
				self.data.insert(SNAPSHOT_KEY.to_string(), k.to_string());
			}
			None => {
				self.data.remove(SNAPSHOT_KEY);
			}
		}
	}
}

/// The external keyed system table holding [`StateRow`]s.
pub trait StateTable: Send + Sync {
	fn scan(&self) -> Result<Vec<StateRow>>;

	fn fetch(&self, key: &StateRowKey) -> Result<Option<StateRow>>;

	fn insert(&self, row: StateRow) -> Result<()>;

	/// Updates an existing row. Returns `false` when the row is gone,
	/// which callers treat as "lost the race against deletion" rather
	/// than an error.
	fn update(&self, row: StateRow) -> Result<bool>;

	fn delete(&self, key: &StateRowKey) -> Result<bool>;
}
