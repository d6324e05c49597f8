// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

//! Catalog collaborator: stream CRUD, tablet listings and the
//! per-namespace type metadata the decoder's caches are fed from.

use std::collections::HashMap;

use veradb_core::{NamespaceId, Result, StreamId, TableId, TabletId};

use crate::stream::{CheckpointType, RecordFormat, RecordType, SourceType, StreamMetadata};

/// One tablet as reported by the catalog, with the split-parent link
/// used to detect tablet splits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabletListEntry {
	pub tablet_id: TabletId,
	pub table_id: TableId,
	pub split_parent: Option<TabletId>,
}

#[derive(Debug, Clone)]
pub struct CreateStreamOptions {
	pub namespace_id: NamespaceId,
	pub table_ids: Vec<TableId>,
	pub source_type: SourceType,
	pub checkpoint_type: CheckpointType,
	pub record_type: RecordType,
	pub record_format: RecordFormat,
}

pub trait CatalogClient: Send + Sync {
	fn create_stream(&self, options: CreateStreamOptions) -> Result<StreamId>;

	fn delete_streams(&self, stream_ids: &[StreamId]) -> Result<()>;

	/// Fails with `CdcError::StreamNotFound` for unknown or deleted
	/// streams.
	fn get_stream(&self, stream_id: &StreamId) -> Result<StreamMetadata>;

	fn tablets_of_table(&self, table_id: &TableId) -> Result<Vec<TabletListEntry>>;

	fn enum_labels(&self, namespace_id: &NamespaceId) -> Result<HashMap<u32, String>>;

	fn composite_attributes(&self, namespace_id: &NamespaceId) -> Result<HashMap<u32, Vec<String>>>;
}
