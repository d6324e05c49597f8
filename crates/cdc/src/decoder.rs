// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

//! The row decoder boundary. Decoding WAL entries into change records
//! is a black box behind [`ChangeDecoder`]; the service only inspects
//! positions, timestamps and the structured errors it returns
//! (`TypeCacheMiss`, `TabletSplit`, `CheckpointTooOld`).

use veradb_core::{HybridTime, OpId, Result, TabletId};

use crate::stream::StreamMetadata;

/// One decoded change handed to the consumer. The payload encoding is
/// owned by the decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
	pub op_id: OpId,
	pub commit_time: HybridTime,
	pub payload: Vec<u8>,
}

impl ChangeRecord {
	pub fn payload_bytes(&self) -> u64 {
		self.payload.len() as u64
	}
}

#[derive(Debug)]
pub struct DecodeRequest<'a> {
	pub stream: &'a StreamMetadata,
	pub tablet_id: &'a TabletId,
	/// Position to resume from; records strictly after this op id.
	pub from_op_id: OpId,
	pub safe_hybrid_time: Option<HybridTime>,
	/// Snapshot continuation cursor; `Some` while a snapshot is being
	/// served.
	pub snapshot_key: Option<String>,
	/// Wall-clock micros after which the decoder must give back
	/// whatever it has.
	pub deadline_micros: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeResponse {
	pub records: Vec<ChangeRecord>,
	/// Last op id handed to the consumer.
	pub sent_op_id: OpId,
	/// Highest op id known committed; what implicit checkpointing
	/// advances to.
	pub commit_op_id: OpId,
	pub safe_hybrid_time: Option<HybridTime>,
	/// `Some` when a snapshot has more rows to serve.
	pub snapshot_key: Option<String>,
}

impl DecodeResponse {
	pub fn payload_bytes(&self) -> u64 {
		self.records.iter().map(ChangeRecord::payload_bytes).sum()
	}
}

pub trait ChangeDecoder: Send + Sync {
	fn decode(&self, request: DecodeRequest<'_>) -> Result<DecodeResponse>;
}
