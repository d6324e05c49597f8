// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

use std::collections::HashMap;

use parking_lot::Mutex;
use uuid::Uuid;
use veradb_cdc::{CatalogClient, CreateStreamOptions, StreamMetadata, TabletListEntry};
use veradb_core::{CdcError, NamespaceId, Result, StreamId, TableId, TabletId};

#[derive(Default)]
struct CatalogInner {
	streams: HashMap<StreamId, StreamMetadata>,
	tablets: HashMap<TableId, Vec<TabletListEntry>>,
	enum_labels: HashMap<NamespaceId, HashMap<u32, String>>,
	composite_attributes: HashMap<NamespaceId, HashMap<u32, Vec<String>>>,
}

/// Catalog backed by in-memory maps. Streams created through the
/// trait get a fresh uuid.
#[derive(Default)]
pub struct MemoryCatalog {
	inner: Mutex<CatalogInner>,
}

impl MemoryCatalog {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_stream(&self, metadata: StreamMetadata) {
		self.inner.lock().streams.insert(metadata.stream_id.clone(), metadata);
	}

	pub fn remove_stream(&self, stream_id: &StreamId) {
		self.inner.lock().streams.remove(stream_id);
	}

	pub fn add_table(&self, table_id: impl Into<TableId>, tablets: Vec<TabletListEntry>) {
		self.inner.lock().tablets.insert(table_id.into(), tablets);
	}

	/// Convenience: plain tablets with no split parents.
	pub fn add_table_with_tablets(&self, table_id: impl Into<TableId>, tablet_ids: &[&str]) {
		let table_id = table_id.into();
		let tablets = tablet_ids
			.iter()
			.map(|id| TabletListEntry {
				tablet_id: TabletId::from(*id),
				table_id: table_id.clone(),
				split_parent: None,
			})
			.collect();
		self.add_table(table_id, tablets);
	}

	pub fn set_enum_labels(&self, namespace_id: impl Into<NamespaceId>, labels: HashMap<u32, String>) {
		self.inner.lock().enum_labels.insert(namespace_id.into(), labels);
	}

	pub fn set_composite_attributes(
		&self,
		namespace_id: impl Into<NamespaceId>,
		attributes: HashMap<u32, Vec<String>>,
	) {
		self.inner.lock().composite_attributes.insert(namespace_id.into(), attributes);
	}
}

impl CatalogClient for MemoryCatalog {
	fn create_stream(&self, options: CreateStreamOptions) -> Result<StreamId> {
		let stream_id = StreamId::from(Uuid::new_v4().simple().to_string());
		let metadata = StreamMetadata {
			stream_id: stream_id.clone(),
			namespace_id: options.namespace_id,
			table_ids: options.table_ids,
			source_type: options.source_type,
			checkpoint_type: options.checkpoint_type,
			record_type: options.record_type,
			record_format: options.record_format,
		};
		self.inner.lock().streams.insert(stream_id.clone(), metadata);
		Ok(stream_id)
	}

	fn delete_streams(&self, stream_ids: &[StreamId]) -> Result<()> {
		let mut inner = self.inner.lock();
		for stream_id in stream_ids {
			inner.streams.remove(stream_id);
		}
		Ok(())
	}

	fn get_stream(&self, stream_id: &StreamId) -> Result<StreamMetadata> {
		self.inner.lock().streams.get(stream_id).cloned().ok_or_else(|| CdcError::StreamNotFound {
			stream_id: stream_id.clone(),
		})
	}

	fn tablets_of_table(&self, table_id: &TableId) -> Result<Vec<TabletListEntry>> {
		self.inner.lock().tablets.get(table_id).cloned().ok_or_else(|| CdcError::TableNotFound {
			table_id: table_id.clone(),
		})
	}

	fn enum_labels(&self, namespace_id: &NamespaceId) -> Result<HashMap<u32, String>> {
		Ok(self.inner.lock().enum_labels.get(namespace_id).cloned().unwrap_or_default())
	}

	fn composite_attributes(&self, namespace_id: &NamespaceId) -> Result<HashMap<u32, Vec<String>>> {
		Ok(self.inner.lock().composite_attributes.get(namespace_id).cloned().unwrap_or_default())
	}
}
