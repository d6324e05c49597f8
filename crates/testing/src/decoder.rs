// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

use std::collections::VecDeque;

use parking_lot::Mutex;
use veradb_cdc::{ChangeDecoder, ChangeRecord, DecodeRequest, DecodeResponse};
use veradb_core::{HybridTime, OpId, Result, TabletId};

/// What the decoder was asked, captured for assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedDecode {
	pub tablet_id: TabletId,
	pub from_op_id: OpId,
	pub snapshot_key: Option<String>,
	pub deadline_micros: u64,
}

/// Scripted decoder: queued responses are returned in order; with an
/// empty queue it echoes the request position with no records.
#[derive(Default)]
pub struct MockDecoder {
	responses: Mutex<VecDeque<Result<DecodeResponse>>>,
	requests: Mutex<Vec<RecordedDecode>>,
}

impl MockDecoder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push_response(&self, response: Result<DecodeResponse>) {
		self.responses.lock().push_back(response);
	}

	/// Queues a successful batch ending at `sent`, committed up to
	/// `commit`, with `count` records.
	pub fn push_batch(&self, sent: OpId, commit: OpId, count: usize, commit_time: HybridTime) {
		let records = (0..count)
			.map(|i| ChangeRecord {
				op_id: OpId::new(sent.term, sent.index - (count as i64 - 1 - i as i64)),
				commit_time,
				payload: vec![0u8; 16],
			})
			.collect();
		self.push_response(Ok(DecodeResponse {
			records,
			sent_op_id: sent,
			commit_op_id: commit,
			safe_hybrid_time: Some(commit_time),
			snapshot_key: None,
		}));
	}

	pub fn requests(&self) -> Vec<RecordedDecode> {
		self.requests.lock().clone()
	}

	pub fn request_count(&self) -> usize {
		self.requests.lock().len()
	}
}

impl ChangeDecoder for MockDecoder {
	fn decode(&self, request: DecodeRequest<'_>) -> Result<DecodeResponse> {
		self.requests.lock().push(RecordedDecode {
			tablet_id: request.tablet_id.clone(),
			from_op_id: request.from_op_id,
			snapshot_key: request.snapshot_key.clone(),
			deadline_micros: request.deadline_micros,
		});
		match self.responses.lock().pop_front() {
			Some(response) => response,
			None => Ok(DecodeResponse {
				records: Vec::new(),
				sent_op_id: request.from_op_id,
				commit_op_id: request.from_op_id,
				safe_hybrid_time: request.safe_hybrid_time,
				snapshot_key: None,
			}),
		}
	}
}
