// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

//! In-memory implementations of the CDC service's collaborators,
//! used by unit and integration tests.

mod catalog;
mod decoder;
mod logging;
mod state_table;
mod tablet;

pub use catalog::MemoryCatalog;
pub use decoder::{MockDecoder, RecordedDecode};
pub use logging::init_tracing;
pub use state_table::MemoryStateTable;
pub use tablet::{MockTabletManager, MockTabletPeer};

use veradb_cdc::{CheckpointType, RecordFormat, RecordType, SourceType, StreamMetadata};
use veradb_core::{NamespaceId, StreamId, TableId};

/// Stream metadata with test defaults.
pub fn stream_metadata(
	stream_id: impl Into<StreamId>,
	namespace_id: impl Into<NamespaceId>,
	table_ids: Vec<TableId>,
	source_type: SourceType,
	checkpoint_type: CheckpointType,
) -> StreamMetadata {
	StreamMetadata {
		stream_id: stream_id.into(),
		namespace_id: namespace_id.into(),
		table_ids,
		source_type,
		checkpoint_type,
		record_type: RecordType::Change,
		record_format: match source_type {
			SourceType::XCluster => RecordFormat::Wal,
			SourceType::CdcSdk => RecordFormat::Proto,
		},
	}
}
