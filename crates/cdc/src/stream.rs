// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

//! Stream metadata and its read-through cache.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use veradb_core::{NamespaceId, Result, StreamId, TableId};

use crate::catalog::CatalogClient;

/// Who consumes the stream. Cross-cluster replication advances
/// checkpoints implicitly; SDK consumers choose implicit or explicit
/// acknowledgement and carry active-time expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
	XCluster,
	CdcSdk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckpointType {
	Implicit,
	Explicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
	Change,
	All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordFormat {
	Wal,
	Json,
	Proto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
	pub stream_id: StreamId,
	pub namespace_id: NamespaceId,
	pub table_ids: Vec<TableId>,
	pub source_type: SourceType,
	pub checkpoint_type: CheckpointType,
	pub record_type: RecordType,
	pub record_format: RecordFormat,
}

/// Read-through stream metadata cache. Entries never expire; they are
/// removed explicitly when a stream is deleted or the catalog reports
/// it gone.
pub struct StreamCache {
	streams: RwLock<HashMap<StreamId, Arc<StreamMetadata>>>,
}

impl StreamCache {
	pub fn new() -> Self {
		Self {
			streams: RwLock::new(HashMap::new()),
		}
	}

	pub fn get(&self, catalog: &dyn CatalogClient, stream_id: &StreamId) -> Result<Arc<StreamMetadata>> {
		if let Some(metadata) = self.streams.read().get(stream_id) {
			return Ok(metadata.clone());
		}
		// Fetch outside the lock, then re-check: a concurrent caller
		// may have won the race.
		let fetched = Arc::new(catalog.get_stream(stream_id)?);
		let mut streams = self.streams.write();
		Ok(streams.entry(stream_id.clone()).or_insert(fetched).clone())
	}

	pub fn peek(&self, stream_id: &StreamId) -> Option<Arc<StreamMetadata>> {
		self.streams.read().get(stream_id).cloned()
	}

	pub fn remove(&self, stream_id: &StreamId) -> bool {
		self.streams.write().remove(stream_id).is_some()
	}

	pub fn clear(&self) {
		self.streams.write().clear();
	}
}

impl Default for StreamCache {
	fn default() -> Self {
		Self::new()
	}
}
