// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

//! Administrative operations: stream lifecycle, checkpoint
//! management, polling topology and replication probes.

use std::{
	collections::{HashMap, HashSet},
	thread,
	time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, info};
use veradb_core::{CdcError, HybridTime, OpId, Result, StreamId, TableId, TabletId};

use super::CdcService;
use crate::{
	catalog::{CreateStreamOptions, TabletListEntry},
	rpc::{
		DbStreamInfo, ReplicationDrainStatus, SetCheckpointRequest, SetCheckpointResponse,
		TabletCheckpointPair,
	},
	state_table::{StateRow, StateRowKey},
	stream::{CheckpointType, RecordFormat, RecordType, SourceType},
	tablet::RetentionBarrier,
};

/// Pause between replication drain sweeps.
const DRAIN_RETRY_INTERVAL: Duration = Duration::from_millis(100);

impl CdcService {
	pub fn create_stream(&self, options: CreateStreamOptions) -> Result<StreamId> {
		if options.table_ids.is_empty() {
			return Err(CdcError::invalid_request("a stream needs at least one table"));
		}
		let stream_id = self.ctx().catalog.create_stream(options)?;
		info!(stream = %stream_id, "created stream");
		Ok(stream_id)
	}

	/// Deletes streams from the catalog and drops their cached
	/// metadata and metrics. State table rows are reclaimed by the
	/// reconciliation loop once the catalog stops knowing the stream.
	pub fn delete_streams(&self, stream_ids: &[StreamId]) -> Result<()> {
		let ctx = self.ctx();
		ctx.catalog.delete_streams(stream_ids)?;
		for stream_id in stream_ids {
			ctx.streams.remove(stream_id);
			for info in ctx.store.tablets_for_stream(stream_id) {
				ctx.metrics.remove(&info);
			}
			info!(stream = %stream_id, "deleted stream");
		}
		Ok(())
	}

	/// Tablets of a stream; `local_only` keeps just the ones this
	/// node hosts a peer for.
	pub fn list_tablets(&self, stream_id: &StreamId, local_only: bool) -> Result<Vec<TabletListEntry>> {
		let ctx = self.ctx();
		let stream = ctx.streams.get(ctx.catalog.as_ref(), stream_id)?;
		let mut entries = Vec::new();
		for table_id in &stream.table_ids {
			entries.extend(ctx.catalog.tablets_of_table(table_id)?);
		}
		if local_only {
			entries.retain(|e| ctx.tablets.peer(&e.tablet_id).is_some());
		}
		Ok(entries)
	}

	/// The durable checkpoint for a pair; the store when fresh, the
	/// state table otherwise. [`OpId::INVALID`] means never
	/// checkpointed.
	pub fn get_checkpoint(&self, stream_id: &StreamId, tablet_id: &TabletId) -> Result<OpId> {
		let ctx = self.ctx();
		let info = ctx.producer_info(stream_id, tablet_id);
		if ctx.config.enable_state_table_caching {
			if let Some(op) = ctx.store.last_checkpoint(&info, ctx.config.checkpoint_update_interval)
			{
				return Ok(op);
			}
		}
		match ctx.state_table.fetch(&ctx.row_key(&info))? {
			Some(row) => row.checkpoint_op_id(),
			None => Ok(OpId::INVALID),
		}
	}

	/// Forces a pair's checkpoint: either to an explicit position or,
	/// with `bootstrap`, to the latest entry of the tablet's log. The
	/// write always reaches the state table.
	pub fn set_checkpoint(&self, request: SetCheckpointRequest) -> Result<SetCheckpointResponse> {
		let ctx = self.ctx();
		if !self.is_running() {
			return Err(CdcError::NotRunning);
		}
		let peer = ctx.tablets.peer(&request.tablet_id).ok_or_else(|| CdcError::TabletNotFound {
			tablet_id: request.tablet_id.clone(),
		})?;
		if peer.leader_term().is_none() {
			return Err(CdcError::NotLeader {
				tablet_id: request.tablet_id.clone(),
			});
		}

		let latest = peer.latest_op_id();
		let checkpoint = if request.bootstrap {
			latest
		} else {
			let cp = request
				.checkpoint
				.ok_or_else(|| CdcError::invalid_request("checkpoint or bootstrap required"))?;
			if !cp.is_valid() {
				return Err(CdcError::invalid_request(format!("invalid checkpoint {cp}")));
			}
			if cp > latest {
				return Err(CdcError::invalid_request(format!(
					"checkpoint {cp} is ahead of the log ({latest})"
				)));
			}
			cp
		};

		let info = ctx.producer_info(&request.stream_id, &request.tablet_id);
		ctx.store.add_tablet_checkpoint(&info, checkpoint);
		ctx.store.force_state_update(&info);
		ctx.store.update_checkpoint(
			&info,
			checkpoint,
			checkpoint,
			ctx.config.checkpoint_update_interval,
		);

		let now = ctx.clock.now_micros();
		let safe_time = peer.safe_time();
		let key = ctx.row_key(&info);
		let existing = ctx.state_table.fetch(&key)?;
		let mut row = existing.clone().unwrap_or_else(|| StateRow::new(key, checkpoint));
		row.set_checkpoint(checkpoint);
		row.set_active_time(now);
		if safe_time.is_valid() {
			row.set_safe_time(safe_time);
		}
		match existing {
			Some(_) => {
				ctx.state_table.update(row)?;
			}
			None => ctx.state_table.insert(row)?,
		}

		if request.initial_checkpoint {
			peer.apply_retention(RetentionBarrier {
				min_replicated_index: checkpoint.index,
				intents_min_index: checkpoint.index,
				history_cutoff: safe_time,
			})?;
		}

		debug!(
			stream = %request.stream_id,
			tablet = %request.tablet_id,
			checkpoint = %checkpoint,
			"checkpoint set"
		);
		Ok(SetCheckpointResponse {
			checkpoint,
		})
	}

	/// Split-aware polling topology for a stream.
	///
	/// A split parent stays pollable until it is fully consumed (its
	/// row gone or at [`OpId::MAX`]); only then do its children take
	/// its place.
	pub fn get_tablet_list_to_poll(&self, stream_id: &StreamId) -> Result<Vec<TabletCheckpointPair>> {
		let ctx = self.ctx();
		let stream = ctx.streams.get(ctx.catalog.as_ref(), stream_id)?;
		let mut entries = Vec::new();
		for table_id in &stream.table_ids {
			entries.extend(ctx.catalog.tablets_of_table(table_id)?);
		}

		let mut result = Vec::new();
		let mut parents_emitted: HashSet<TabletId> = HashSet::new();
		for entry in &entries {
			if let Some(parent) = &entry.split_parent {
				let parent_row =
					ctx.state_table.fetch(&StateRowKey::new(parent.clone(), stream_id))?;
				let parent_live = match &parent_row {
					Some(row) => !row.checkpoint_op_id()?.is_max(),
					None => false,
				};
				if parent_live {
					if parents_emitted.insert(parent.clone()) {
						let row = parent_row.unwrap_or_else(|| {
							StateRow::new(
								StateRowKey::new(parent.clone(), stream_id),
								OpId::MIN,
							)
						});
						result.push(TabletCheckpointPair {
							tablet_id: parent.clone(),
							checkpoint: row.checkpoint_op_id()?,
							snapshot_key: row.snapshot_key().map(str::to_string),
						});
					}
					continue;
				}
			}
			let row = ctx.state_table.fetch(&StateRowKey::new(entry.tablet_id.clone(), stream_id))?;
			let (checkpoint, snapshot_key) = match row {
				Some(row) => {
					(row.checkpoint_op_id()?, row.snapshot_key().map(str::to_string))
				}
				None => (OpId::MIN, None),
			};
			result.push(TabletCheckpointPair {
				tablet_id: entry.tablet_id.clone(),
				checkpoint,
				snapshot_key,
			});
		}
		Ok(result)
	}

	/// Whether any of the given tablets can no longer serve the
	/// stream from its durable checkpoint, meaning the consumer must
	/// re-bootstrap.
	pub fn is_bootstrap_required(&self, stream_id: &StreamId, tablet_ids: &[TabletId]) -> Result<bool> {
		let ctx = self.ctx();
		for tablet_id in tablet_ids {
			let Some(peer) = ctx.tablets.peer(tablet_id) else {
				continue;
			};
			let info = ctx.producer_info(stream_id, tablet_id);
			let from_index = match ctx.state_table.fetch(&ctx.row_key(&info))? {
				Some(row) => {
					let op = row.checkpoint_op_id()?;
					if op.is_valid() {
						op.index
					} else {
						0
					}
				}
				None => 0,
			};
			if !peer.log_available_from(from_index) {
				debug!(stream = %stream_id, tablet = %tablet_id, from_index, "bootstrap required");
				return Ok(true);
			}
		}
		Ok(false)
	}

	/// Sweeps the given pairs until each has replicated everything up
	/// to `target_time`, retrying until `deadline_micros`.
	pub fn check_replication_drain(
		&self,
		pairs: &[(StreamId, TabletId)],
		target_time: HybridTime,
		deadline_micros: u64,
	) -> Result<ReplicationDrainStatus> {
		let ctx = self.ctx();
		let mut drained = Vec::new();
		let mut pending: Vec<(StreamId, TabletId)> = pairs.to_vec();

		loop {
			let mut still_pending = Vec::new();
			for (stream_id, tablet_id) in pending {
				let Some(peer) = ctx.tablets.peer(&tablet_id) else {
					still_pending.push((stream_id, tablet_id));
					continue;
				};
				if peer.leader_term().is_none() {
					still_pending.push((stream_id, tablet_id));
					continue;
				}
				let info = ctx.producer_info(&stream_id, &tablet_id);
				let sent = ctx.store.get(&info).map(|s| s.sent.op_id).unwrap_or(OpId::INVALID);
				let caught_up =
					sent.is_valid() && sent >= peer.latest_op_id() && peer.safe_time() >= target_time;
				if caught_up {
					drained.push((stream_id, tablet_id));
				} else {
					still_pending.push((stream_id, tablet_id));
				}
			}
			pending = still_pending;
			if pending.is_empty() {
				break;
			}
			let now = ctx.clock.now_micros();
			if now + DRAIN_RETRY_INTERVAL.as_micros() as u64 >= deadline_micros {
				break;
			}
			// Backoff through the injected clock so the deadline and
			// the waiting share one time source.
			ctx.clock.sleep(DRAIN_RETRY_INTERVAL);
		}

		Ok(ReplicationDrainStatus {
			drained,
			undrained: pending,
		})
	}

	pub fn get_db_stream_info(&self, stream_id: &StreamId) -> Result<DbStreamInfo> {
		let ctx = self.ctx();
		let stream = ctx.streams.get(ctx.catalog.as_ref(), stream_id)?;
		Ok(DbStreamInfo {
			stream_id: stream.stream_id.clone(),
			namespace_id: stream.namespace_id.clone(),
			table_ids: stream.table_ids.clone(),
		})
	}

	/// Creates one cross-cluster stream per table and seeds each
	/// tablet's state row at the latest entry of its log, so
	/// replication starts from "now" without losing writes.
	pub fn bootstrap_producer(
		&self,
		namespace_id: &veradb_core::NamespaceId,
		table_ids: &[TableId],
	) -> Result<Vec<StreamId>> {
		let ctx = self.ctx();
		if table_ids.is_empty() {
			return Err(CdcError::invalid_request("bootstrap needs at least one table"));
		}

		if ctx.config.parallelize_bootstrap && table_ids.len() > 1 {
			let results: Mutex<HashMap<usize, Result<StreamId>>> = Mutex::new(HashMap::new());
			thread::scope(|scope| {
				for (index, table_id) in table_ids.iter().enumerate() {
					let results = &results;
					scope.spawn(move || {
						let result = self.bootstrap_table(namespace_id, table_id);
						results.lock().insert(index, result);
					});
				}
			});
			let mut results = results.into_inner();
			let mut stream_ids = Vec::with_capacity(table_ids.len());
			for index in 0..table_ids.len() {
				let result = results
					.remove(&index)
					.unwrap_or_else(|| Err(CdcError::internal("bootstrap worker vanished")));
				stream_ids.push(result?);
			}
			Ok(stream_ids)
		} else {
			table_ids.iter().map(|t| self.bootstrap_table(namespace_id, t)).collect()
		}
	}

	fn bootstrap_table(
		&self,
		namespace_id: &veradb_core::NamespaceId,
		table_id: &TableId,
	) -> Result<StreamId> {
		let ctx = self.ctx();
		let stream_id = ctx.catalog.create_stream(CreateStreamOptions {
			namespace_id: namespace_id.clone(),
			table_ids: vec![table_id.clone()],
			source_type: SourceType::XCluster,
			checkpoint_type: CheckpointType::Implicit,
			record_type: RecordType::Change,
			record_format: RecordFormat::Wal,
		})?;

		for entry in ctx.catalog.tablets_of_table(table_id)? {
			let peer =
				ctx.tablets.peer(&entry.tablet_id).ok_or_else(|| CdcError::TabletNotFound {
					tablet_id: entry.tablet_id.clone(),
				})?;
			let latest = peer.latest_op_id();
			let key = StateRowKey::new(entry.tablet_id.clone(), &stream_id);
			ctx.state_table.insert(StateRow::new(key, latest))?;
			let info = ctx.producer_info(&stream_id, &entry.tablet_id);
			ctx.store.add_tablet_checkpoint(&info, latest);
		}
		info!(stream = %stream_id, table = %table_id, "bootstrapped producer stream");
		Ok(stream_id)
	}

	/// Direct retention push from a remote replication coordinator.
	pub fn update_replicated_index(&self, tablet_id: &TabletId, replicated_index: i64) -> Result<()> {
		let ctx = self.ctx();
		if replicated_index < 0 {
			return Err(CdcError::invalid_request("replicated index must be non-negative"));
		}
		let peer = ctx.tablets.peer(tablet_id).ok_or_else(|| CdcError::TabletNotFound {
			tablet_id: tablet_id.clone(),
		})?;
		peer.apply_retention(RetentionBarrier {
			min_replicated_index: replicated_index,
			intents_min_index: replicated_index,
			history_cutoff: HybridTime::INVALID,
		})
	}

	pub fn get_latest_entry_op_id(&self, tablet_id: &TabletId) -> Result<OpId> {
		let ctx = self.ctx();
		let peer = ctx.tablets.peer(tablet_id).ok_or_else(|| CdcError::TabletNotFound {
			tablet_id: tablet_id.clone(),
		})?;
		Ok(peer.latest_op_id())
	}
}
