// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

//! The consumer-facing read path.
//!
//! A GetChanges call walks a fixed sequence: admission, validation,
//! leadership, deadline, position resolution, decode (with one
//! structured retry), leadership re-verification, checkpoint
//! advancement, retention push, metrics. Any failure maps onto the
//! transport error taxonomy via `CdcError::code()`.

use std::sync::{Arc, atomic::Ordering};

use tracing::{debug, warn};
use veradb_core::{
	CdcError, HybridTime, MemTracker, OpId, ProducerTabletInfo, Result, TabletId,
};

use super::{CdcService, Context};
use crate::{
	decoder::{DecodeRequest, DecodeResponse},
	metrics::{TabletMetrics, metrics_id},
	rpc::{GetChangesRequest, GetChangesResponse},
	state_table::{StateRow, StateRowKey},
	stream::{CheckpointType, SourceType, StreamMetadata},
	tablet::{RetentionBarrier, TabletPeer},
};

/// Per-request strategy selected once from the stream's source type.
/// Keeps source-specific policy (expiry, commit-point choice) in one
/// place instead of scattered branches.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SourceOps {
	source_type: SourceType,
	checkpoint_type: CheckpointType,
}

impl SourceOps {
	pub fn for_stream(stream: &StreamMetadata) -> Self {
		Self {
			source_type: stream.source_type,
			checkpoint_type: stream.checkpoint_type,
		}
	}

	/// Only SDK streams carry activity-based expiry.
	pub fn enforces_expiry(&self) -> bool {
		matches!(self.source_type, SourceType::CdcSdk)
	}

	pub fn is_sdk(&self) -> bool {
		matches!(self.source_type, SourceType::CdcSdk)
	}

	/// The position the durable checkpoint may advance to for this
	/// request. `OpId::INVALID` means "do not advance".
	pub fn commit_point(
		&self,
		request: &GetChangesRequest,
		from_op_id: OpId,
		response: &DecodeResponse,
		snapshot_active: bool,
	) -> OpId {
		// While a snapshot is being served the durable checkpoint
		// stays pinned at the snapshot boundary.
		if snapshot_active {
			return from_op_id;
		}
		match (self.source_type, self.checkpoint_type) {
			(SourceType::XCluster, _) => response.commit_op_id,
			(SourceType::CdcSdk, CheckpointType::Implicit) => response.commit_op_id,
			(SourceType::CdcSdk, CheckpointType::Explicit) => {
				request.explicit_checkpoint.unwrap_or(OpId::INVALID)
			}
		}
	}
}

impl CdcService {
	pub fn get_changes(&self, request: GetChangesRequest) -> Result<GetChangesResponse> {
		let ctx = self.ctx();
		if !ctx.enabled.load(Ordering::Acquire) {
			return Err(CdcError::NotRunning);
		}
		let _permit = ctx
			.semaphore
			.try_acquire()
			.ok_or_else(|| CdcError::leader_not_ready("no GetChanges capacity available"))?;

		if request.stream_id.as_str().is_empty() || request.tablet_id.as_str().is_empty() {
			return Err(CdcError::invalid_request("stream id and tablet id are required"));
		}

		let stream = ctx.streams.get(ctx.catalog.as_ref(), &request.stream_id)?;
		let ops = SourceOps::for_stream(&stream);
		let info = ctx.producer_info(&request.stream_id, &request.tablet_id);

		// Colocated snapshots keep their cursor on a per-table row.
		let row_key = match &request.colocated_table_id {
			Some(table_id) => {
				if !stream.table_ids.contains(table_id) {
					return Err(CdcError::invalid_request(format!(
						"table '{}' is not part of stream '{}'",
						table_id, request.stream_id
					)));
				}
				StateRowKey::colocated(request.tablet_id.clone(), &request.stream_id, table_id)
			}
			None => ctx.row_key(&info),
		};

		self.check_tablet_valid_for_stream(&info, &stream)?;

		let peer = ctx.tablets.peer(&request.tablet_id).ok_or_else(|| CdcError::TabletNotFound {
			tablet_id: request.tablet_id.clone(),
		})?;
		let term = peer.leader_term().ok_or_else(|| CdcError::NotLeader {
			tablet_id: request.tablet_id.clone(),
		})?;
		if !peer.is_leader_ready() {
			return Err(CdcError::leader_not_ready(format!(
				"leader peer for tablet '{}' is still catching up",
				request.tablet_id
			)));
		}

		// The decoder gets less than the full rpc budget so the
		// response still makes it out before the deadline.
		let now = ctx.clock.now_micros();
		let margin = ctx.config.safe_deadline_margin().as_micros() as u64;
		let decode_deadline = request.deadline_micros.saturating_sub(margin);
		if decode_deadline <= now {
			return Err(CdcError::leader_not_ready("insufficient time left before the deadline"));
		}

		let metrics = ctx.metrics.get_or_create(&info, stream.source_type);
		let _tracker = ctx
			.store
			.mem_tracker(&info, || MemTracker::find_or_create(&ctx.mem_root, &metrics_id(&info)));

		if request.need_schema_info {
			for table_id in &stream.table_ids {
				ctx.store.clear_schema_version(&info, table_id);
			}
		}

		let mut snapshot_key = request.snapshot_key.clone();
		let from_op_id = match request.from_op_id {
			Some(op) if op.is_valid() => op,
			_ => self.resolve_position(&info, &row_key, ops, &mut snapshot_key)?,
		};

		if ops.enforces_expiry() {
			self.check_stream_active(&info)?;
			ctx.store.update_active_time(&info, now);
		}

		// A paused stream answers successfully with the unchanged
		// position so the consumer slows down instead of erroring;
		// nothing is decoded or persisted.
		if ctx.paused_streams.read().contains(&request.stream_id) {
			debug!(stream = %request.stream_id, tablet = %request.tablet_id, "replication paused");
			return Ok(GetChangesResponse {
				records: Vec::new(),
				checkpoint: from_op_id,
				safe_hybrid_time: None,
				snapshot_key,
			});
		}

		let response = self.decode_with_retry(
			ctx,
			&stream,
			&info,
			from_op_id,
			request.safe_hybrid_time,
			snapshot_key.clone(),
			decode_deadline,
		)?;

		// The decode ran without holding a leadership guarantee;
		// serving stale results after losing the lease would break
		// consumers, so re-verify the term before advancing anything.
		if peer.leader_term() != Some(term) {
			return Err(CdcError::NotLeader {
				tablet_id: request.tablet_id.clone(),
			});
		}

		let snapshot_active = snapshot_key.is_some() || response.snapshot_key.is_some();
		let commit = ops.commit_point(&request, from_op_id, &response, snapshot_active);

		// Colocated cursors bypass the in-memory store entirely: the
		// pair's cached positions describe the main row only, and the
		// per-table row carries every committed response.
		let must_persist = if row_key.is_colocated() {
			commit.is_valid()
		} else {
			ctx.store.update_checkpoint(
				&info,
				response.sent_op_id,
				commit,
				ctx.config.checkpoint_update_interval,
			)
		};
		if must_persist {
			self.persist_row(&row_key, commit, &response, ops, now)?;
		}

		if !row_key.is_colocated() {
			let last_commit_time =
				response.records.last().map(|r| r.commit_time).unwrap_or(HybridTime::INVALID);
			ctx.store.update_state_metadata(&info, last_commit_time, response.sent_op_id);

			if ctx.config.enable_log_retention_by_op_idx && commit.is_valid() {
				self.push_min_checkpoint(ctx, &peer, &request.tablet_id);
			}
		}

		self.record_metrics(&metrics, &response, now);

		debug!(
			stream = %request.stream_id,
			tablet = %request.tablet_id,
			records = response.records.len(),
			checkpoint = %response.sent_op_id,
			"served changes"
		);

		Ok(GetChangesResponse {
			records: response.records,
			checkpoint: response.sent_op_id,
			safe_hybrid_time: response.safe_hybrid_time,
			snapshot_key: response.snapshot_key,
		})
	}

	/// Ensures the (stream, tablet) pair is tracked, repopulating the
	/// stream's tablet list from the catalog when it isn't. A tablet
	/// that reappears only as somebody's split parent gets the split
	/// error so the consumer re-resolves its tablet list.
	fn check_tablet_valid_for_stream(
		&self,
		info: &ProducerTabletInfo,
		stream: &StreamMetadata,
	) -> Result<()> {
		let ctx = self.ctx();
		if ctx.store.pre_check_tablet_valid_for_stream(info) {
			return Ok(());
		}

		let mut entries = Vec::new();
		for table_id in &stream.table_ids {
			entries.extend(ctx.catalog.tablets_of_table(table_id)?);
		}
		let tablet_ids: Vec<TabletId> = entries.iter().map(|e| e.tablet_id.clone()).collect();
		let found = ctx.store.register_stream_tablets(
			&ctx.universe_id,
			&stream.stream_id,
			&tablet_ids,
			&info.tablet_id,
		);
		if found {
			return Ok(());
		}
		if entries.iter().any(|e| e.split_parent.as_ref() == Some(&info.tablet_id)) {
			return Err(CdcError::TabletSplit {
				tablet_id: info.tablet_id.clone(),
			});
		}
		Err(CdcError::invalid_request(format!(
			"tablet '{}' is not part of stream '{}'",
			info.tablet_id, info.stream_id
		)))
	}

	/// Durable resume position: the store when fresh, the state table
	/// otherwise. A missing or uninitialized position starts an
	/// XCluster consumer from the beginning; an SDK consumer gets an
	/// error instead, since it must set a checkpoint or take a
	/// snapshot before streaming.
	fn resolve_position(
		&self,
		info: &ProducerTabletInfo,
		key: &StateRowKey,
		ops: SourceOps,
		snapshot_key: &mut Option<String>,
	) -> Result<OpId> {
		let ctx = self.ctx();
		// The in-memory store tracks the pair's main position only;
		// colocated cursors always come from their own row.
		if ctx.config.enable_state_table_caching && !key.is_colocated() {
			if let Some(op) =
				ctx.store.last_checkpoint(info, ctx.config.checkpoint_update_interval)
			{
				if op.is_valid() {
					return Ok(op);
				}
			}
		}
		let resolved = match ctx.state_table.fetch(key)? {
			Some(row) => {
				let op = row.checkpoint_op_id()?;
				if snapshot_key.is_none() {
					*snapshot_key = row.snapshot_key().map(str::to_string);
				}
				op.is_valid().then_some(op)
			}
			None => None,
		};
		match resolved {
			Some(op) => Ok(op),
			None if ops.is_sdk() => Err(CdcError::invalid_request(format!(
				"no valid checkpoint for tablet '{}'; set a checkpoint or take a snapshot first",
				info.tablet_id
			))),
			None => Ok(OpId::MIN),
		}
	}

	/// SDK streams stop being served once their consumer has been
	/// idle past the intent retention window.
	fn check_stream_active(&self, info: &ProducerTabletInfo) -> Result<()> {
		let ctx = self.ctx();
		let now = ctx.clock.now_micros();
		let last_active = match ctx
			.store
			.last_active_time(info, ctx.config.checkpoint_update_interval)
		{
			Some(t) => t,
			None => match ctx.state_table.fetch(&ctx.row_key(info))? {
				Some(row) => match row.active_time() {
					Some(t) => t,
					// Rows written before active-time tracking have
					// no entry; stamp them now so expiry starts
					// counting from here.
					None => {
						let mut row = row;
						row.set_active_time(now);
						ctx.state_table.update(row)?;
						now
					}
				},
				None => now,
			},
		};
		if now.saturating_sub(last_active) > ctx.config.intent_retention.as_micros() as u64 {
			return Err(CdcError::StreamExpired {
				stream_id: info.stream_id.clone(),
				tablet_id: info.tablet_id.clone(),
			});
		}
		Ok(())
	}

	/// Runs the decoder, retrying exactly once after refreshing the
	/// type metadata cache the decoder reported stale. A split signal
	/// seeds the children before surfacing the error.
	#[allow(clippy::too_many_arguments)]
	fn decode_with_retry(
		&self,
		ctx: &Arc<Context>,
		stream: &StreamMetadata,
		info: &ProducerTabletInfo,
		from_op_id: OpId,
		safe_hybrid_time: Option<HybridTime>,
		snapshot_key: Option<String>,
		deadline_micros: u64,
	) -> Result<DecodeResponse> {
		let build = |snapshot_key: Option<String>| DecodeRequest {
			stream,
			tablet_id: &info.tablet_id,
			from_op_id,
			safe_hybrid_time,
			snapshot_key,
			deadline_micros,
		};
		let result = match ctx.decoder.decode(build(snapshot_key.clone())) {
			Err(CdcError::TypeCacheMiss {
				kind,
				namespace_id,
			}) => {
				debug!(%namespace_id, ?kind, "decoder reported stale type cache, retrying once");
				ctx.types.refresh(ctx.catalog.as_ref(), kind, &namespace_id)?;
				ctx.decoder.decode(build(snapshot_key))
			}
			other => other,
		};
		match result {
			Err(CdcError::TabletSplit {
				tablet_id,
			}) => {
				self.handle_split(info, stream)?;
				Err(CdcError::TabletSplit {
					tablet_id,
				})
			}
			other => other,
		}
	}

	/// Seeds state rows and store entries for the split children so
	/// they are pollable before the error reaches the consumer.
	fn handle_split(&self, info: &ProducerTabletInfo, stream: &StreamMetadata) -> Result<()> {
		let ctx = self.ctx();
		let mut children = Vec::new();
		for table_id in &stream.table_ids {
			for entry in ctx.catalog.tablets_of_table(table_id)? {
				if entry.split_parent.as_ref() == Some(&info.tablet_id) {
					children.push(entry.tablet_id);
				}
			}
		}
		if children.is_empty() {
			return Err(CdcError::internal(format!(
				"tablet '{}' reported split but no children are listed",
				info.tablet_id
			)));
		}

		let seed = ctx
			.store
			.get(info)
			.map(|s| s.cdc_state.op_id)
			.filter(|op| op.is_valid())
			.unwrap_or(OpId::MIN);
		for child in &children {
			let key = StateRowKey::new(child.clone(), &info.stream_id);
			if ctx.state_table.fetch(&key)?.is_none() {
				ctx.state_table.insert(StateRow::new(key, seed))?;
			}
		}
		ctx.store.add_entries_for_children_on_split(&info.tablet_id, &children);

		// The split signal means the parent's log has been consumed up
		// to the split point. Mark its row fully consumed so the
		// polling topology hands over to the children; reconciliation
		// reclaims the row once retention is released.
		let parent_key = StateRowKey::new(info.tablet_id.clone(), &info.stream_id);
		if let Some(mut parent_row) = ctx.state_table.fetch(&parent_key)? {
			parent_row.set_checkpoint(OpId::MAX);
			ctx.state_table.update(parent_row)?;
		}

		warn!(
			tablet = %info.tablet_id,
			stream = %info.stream_id,
			children = children.len(),
			"tablet split detected, children seeded"
		);
		Ok(())
	}

	/// Writes the throttled durable checkpoint row.
	fn persist_row(
		&self,
		key: &StateRowKey,
		commit: OpId,
		response: &DecodeResponse,
		ops: SourceOps,
		now_micros: u64,
	) -> Result<()> {
		let ctx = self.ctx();
		let existing = ctx.state_table.fetch(key)?;
		let mut row = existing.clone().unwrap_or_else(|| StateRow::new(key.clone(), commit));
		row.set_checkpoint(commit);
		let replication_time = response
			.records
			.last()
			.map(|r| r.commit_time.physical_micros())
			.unwrap_or(now_micros);
		row.last_replication_time = Some(replication_time);
		if ops.is_sdk() {
			row.set_active_time(now_micros);
			if let Some(safe_time) = response.safe_hybrid_time {
				row.set_safe_time(safe_time);
			}
			row.set_snapshot_key(response.snapshot_key.as_deref());
		}
		match existing {
			Some(_) => {
				if !ctx.state_table.update(row)? {
					// Row deleted underneath us; reconciliation will
					// sort it out. Not an error for the consumer.
					debug!(
						tablet = %key.tablet_id,
						stream = %key.stream_key,
						"checkpoint row vanished during update"
					);
				}
			}
			None => ctx.state_table.insert(row)?,
		}
		Ok(())
	}

	/// Moves the tablet's log retention to the minimum position still
	/// needed by an active consumer.
	fn push_min_checkpoint(&self, ctx: &Arc<Context>, peer: &Arc<dyn TabletPeer>, tablet_id: &TabletId) {
		let freshness = ctx.config.read_timeout * 4;
		let min = ctx.store.min_sent_checkpoint_for_tablet(tablet_id, freshness);
		if min.is_max() || !min.is_valid() {
			return;
		}
		let barrier = RetentionBarrier {
			min_replicated_index: min.index,
			intents_min_index: min.index,
			history_cutoff: HybridTime::INVALID,
		};
		if let Err(e) = peer.apply_retention(barrier) {
			warn!(tablet = %tablet_id, error = %e, "failed to push min checkpoint to log");
		}
	}

	fn record_metrics(&self, metrics: &TabletMetrics, response: &DecodeResponse, now_micros: u64) {
		let last_commit = response.records.last().map(|r| r.commit_time.physical_micros());
		match metrics {
			TabletMetrics::XCluster(m) => {
				m.last_read_opid_index.store(response.sent_op_id.index, Ordering::Relaxed);
				m.last_checkpoint_opid_index.store(response.commit_op_id.index, Ordering::Relaxed);
				m.rpc_payload_bytes_responded.fetch_add(response.payload_bytes(), Ordering::Relaxed);
				m.last_getchanges_time_micros.store(now_micros, Ordering::Relaxed);
				if let Some(commit) = last_commit {
					m.async_replication_sent_lag_micros
						.store(now_micros.saturating_sub(commit), Ordering::Relaxed);
				}
			}
			TabletMetrics::CdcSdk(m) => {
				m.change_event_count.fetch_add(response.records.len() as u64, Ordering::Relaxed);
				m.traffic_sent_bytes.fetch_add(response.payload_bytes(), Ordering::Relaxed);
				if let Some(commit) = last_commit {
					m.sent_lag_micros.store(now_micros.saturating_sub(commit), Ordering::Relaxed);
					m.last_sent_physical_time_micros.store(commit, Ordering::Relaxed);
				}
			}
		}
	}
}
