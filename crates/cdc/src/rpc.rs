// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

//! Request/response shapes of the CDC service surface. Transport
//! framing lives outside this crate; handlers map a [`veradb_core::CdcError`]
//! onto the envelope via `CdcError::code()`.

use veradb_core::{HybridTime, NamespaceId, OpId, StreamId, TableId, TabletId};

use crate::decoder::ChangeRecord;

#[derive(Debug, Clone)]
pub struct GetChangesRequest {
	pub stream_id: StreamId,
	pub tablet_id: TabletId,
	/// Resume position. `None` resolves the durable checkpoint from
	/// the store or the state table.
	pub from_op_id: Option<OpId>,
	/// Acknowledgement carried by explicit-checkpointing consumers.
	pub explicit_checkpoint: Option<OpId>,
	pub safe_hybrid_time: Option<HybridTime>,
	/// Snapshot continuation cursor from the previous response.
	pub snapshot_key: Option<String>,
	/// Set while snapshotting one table of a colocated tablet; the
	/// position is then kept on the `{stream}_{table}` state row.
	pub colocated_table_id: Option<TableId>,
	/// Ask the decoder to re-emit full schema information.
	pub need_schema_info: bool,
	/// Absolute rpc deadline, wall-clock micros.
	pub deadline_micros: u64,
}

impl GetChangesRequest {
	pub fn new(stream_id: StreamId, tablet_id: TabletId, deadline_micros: u64) -> Self {
		Self {
			stream_id,
			tablet_id,
			from_op_id: None,
			explicit_checkpoint: None,
			safe_hybrid_time: None,
			snapshot_key: None,
			colocated_table_id: None,
			need_schema_info: false,
			deadline_micros,
		}
	}
}

#[derive(Debug, Clone)]
pub struct GetChangesResponse {
	pub records: Vec<ChangeRecord>,
	/// Position the consumer should resume from.
	pub checkpoint: OpId,
	pub safe_hybrid_time: Option<HybridTime>,
	/// `Some` while a snapshot has more rows to serve.
	pub snapshot_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SetCheckpointRequest {
	pub stream_id: StreamId,
	pub tablet_id: TabletId,
	/// Ignored when `bootstrap` is set.
	pub checkpoint: Option<OpId>,
	/// Start from the latest entry in the tablet's log.
	pub bootstrap: bool,
	/// Also move the tablet's retention barriers to the new position.
	pub initial_checkpoint: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetCheckpointResponse {
	pub checkpoint: OpId,
}

/// One pollable tablet with the position to resume from.
#[derive(Debug, Clone, PartialEq)]
pub struct TabletCheckpointPair {
	pub tablet_id: TabletId,
	pub checkpoint: OpId,
	pub snapshot_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationDrainStatus {
	pub drained: Vec<(StreamId, TabletId)>,
	pub undrained: Vec<(StreamId, TabletId)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DbStreamInfo {
	pub stream_id: StreamId,
	pub namespace_id: NamespaceId,
	pub table_ids: Vec<TableId>,
}
