// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

//! Background checkpoint reconciliation.
//!
//! A cycle scans the state table, aggregates per-tablet retention
//! minima across streams, pushes retention barriers to local peers
//! and deletes rows whose consumers are all done. Rows belonging to
//! streams the catalog no longer knows are reclaimed here too.

use std::{
	collections::{HashMap, HashSet},
	sync::{Arc, atomic::Ordering},
	thread::{self, JoinHandle},
	time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::{debug, info, warn};
use veradb_core::{CdcError, HybridTime, OpId, Result, TabletId};

use crate::{
	metrics::TabletMetrics,
	service::Context,
	state_table::StateRowKey,
	stream::SourceType,
};

/// Granularity at which the worker re-checks its stop channel.
const TICK: Duration = Duration::from_millis(100);

/// Per-tablet retention positions aggregated across every stream's
/// row during one cycle.
#[derive(Debug, Clone, Copy)]
struct TabletAggregate {
	/// Minimum checkpoint across all consumers; log retention.
	min_checkpoint: OpId,
	/// Minimum checkpoint across SDK consumers; intent retention.
	sdk_min_checkpoint: OpId,
	/// Minimum SDK safe time; history cutoff.
	safe_time: HybridTime,
	/// Latest consumer activity seen.
	active_time_micros: u64,
}

impl TabletAggregate {
	fn new() -> Self {
		Self {
			min_checkpoint: OpId::MAX,
			sdk_min_checkpoint: OpId::MAX,
			safe_time: HybridTime::INVALID,
			active_time_micros: 0,
		}
	}
}

#[derive(Debug, Default)]
struct PopulateResult {
	aggregates: HashMap<TabletId, TabletAggregate>,
	rows_to_delete: Vec<StateRowKey>,
}

/// What one reconciliation cycle did; surfaced for logging and tests.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileOutcome {
	pub tablets_pushed: usize,
	pub rows_deleted: usize,
	pub failed_tablets: Vec<TabletId>,
}

pub(crate) fn reconcile_cycle(ctx: &Arc<Context>) -> Result<ReconcileOutcome> {
	run_cycle(ctx, None)
}

pub(crate) fn reconcile_tablet(ctx: &Arc<Context>, tablet_id: &TabletId) -> Result<ReconcileOutcome> {
	run_cycle(ctx, Some(tablet_id))
}

fn run_cycle(ctx: &Arc<Context>, tablet_filter: Option<&TabletId>) -> Result<ReconcileOutcome> {
	if !ctx.enabled.load(Ordering::Acquire) {
		return Err(CdcError::NotRunning);
	}
	let mut populated = populate_tablet_checkpoint_info(ctx, tablet_filter)?;
	filter_out_tablets_deleted_by_all_streams(&mut populated);
	let failed = push_retention(ctx, &populated.aggregates);
	let deleted = delete_consumed_rows(ctx, &populated.rows_to_delete, &failed)?;
	Ok(ReconcileOutcome {
		tablets_pushed: populated.aggregates.len(),
		rows_deleted: deleted,
		failed_tablets: failed.into_iter().collect(),
	})
}

/// Scans the state table and folds every row into its tablet's
/// aggregate.
///
/// Rows of unknown streams are scheduled for deletion and tracked as
/// an aggregate that holds nothing back; rows of expired SDK streams
/// stop contributing to the minima without being deleted.
fn populate_tablet_checkpoint_info(
	ctx: &Arc<Context>,
	tablet_filter: Option<&TabletId>,
) -> Result<PopulateResult> {
	let now = ctx.clock.now_micros();
	let retention_micros = ctx.config.intent_retention.as_micros() as u64;
	let mut result = PopulateResult::default();

	for row in ctx.state_table.scan()? {
		if let Some(filter) = tablet_filter {
			if &row.key.tablet_id != filter {
				continue;
			}
		}
		// Colocated rows shadow the main row of their pair and carry
		// no independent retention.
		if row.key.is_colocated() {
			continue;
		}
		let (stream_id, _) = row.key.parse_stream();
		let tablet_id = row.key.tablet_id.clone();

		let checkpoint = match row.checkpoint_op_id() {
			Ok(op) => op,
			Err(e) => {
				warn!(tablet = %tablet_id, stream = %stream_id, error = %e, "skipping malformed checkpoint row");
				continue;
			}
		};

		let stream = match ctx.streams.get(ctx.catalog.as_ref(), &stream_id) {
			Ok(stream) => stream,
			Err(CdcError::StreamNotFound {
				..
			}) => {
				// The stream is gone; nothing holds retention and the
				// row itself is garbage.
				debug!(stream = %stream_id, tablet = %tablet_id, "row for deleted stream");
				result.aggregates.entry(tablet_id).or_insert_with(TabletAggregate::new);
				result.rows_to_delete.push(row.key.clone());
				ctx.streams.remove(&stream_id);
				let info = ctx.producer_info(&stream_id, &row.key.tablet_id);
				ctx.metrics.remove(&info);
				continue;
			}
			Err(e) => {
				warn!(stream = %stream_id, error = %e, "failed to resolve stream, skipping row");
				continue;
			}
		};

		let aggregate =
			result.aggregates.entry(tablet_id.clone()).or_insert_with(TabletAggregate::new);

		if stream.source_type == SourceType::CdcSdk {
			let info = ctx.producer_info(&stream_id, &tablet_id);
			let last_active = ctx
				.store
				.last_active_time(&info, ctx.config.checkpoint_update_interval)
				.or(row.active_time())
				.unwrap_or(now);
			if now.saturating_sub(last_active) > retention_micros {
				// Expired consumer: it no longer pins anything, but
				// its row stays until explicitly cleaned up.
				debug!(stream = %stream_id, tablet = %tablet_id, "expired stream ignored for retention");
				continue;
			}
			aggregate.active_time_micros = aggregate.active_time_micros.max(last_active);
			if checkpoint.is_valid() && !checkpoint.is_max() {
				aggregate.sdk_min_checkpoint = aggregate.sdk_min_checkpoint.min(checkpoint);
			}
			if let Some(safe_time) = row.safe_time() {
				aggregate.safe_time = if aggregate.safe_time.is_valid() {
					aggregate.safe_time.min(safe_time)
				} else {
					safe_time
				};
			}
		}

		if checkpoint.is_max() {
			// Fully consumed pair: candidate for deletion.
			result.rows_to_delete.push(row.key.clone());
		} else if checkpoint.is_valid() {
			aggregate.min_checkpoint = aggregate.min_checkpoint.min(checkpoint);
		} else {
			// Never-initialized checkpoint pins everything.
			aggregate.min_checkpoint = OpId::MIN;
		}
	}
	Ok(result)
}

/// A row may only be deleted when no consumer of its tablet still
/// holds retention, i.e. the tablet is done for all streams.
fn filter_out_tablets_deleted_by_all_streams(populated: &mut PopulateResult) {
	let aggregates = &populated.aggregates;
	populated.rows_to_delete.retain(|key| {
		aggregates
			.get(&key.tablet_id)
			.map(|agg| agg.min_checkpoint.is_max() && agg.sdk_min_checkpoint.is_max())
			.unwrap_or(true)
	});
}

/// Pushes each tablet's aggregate to its local peer. Tablets with no
/// remaining consumer get their retention released on a
/// failure-tolerant path; everything else is tracked so row deletion
/// can be withheld for tablets whose push failed.
fn push_retention(
	ctx: &Arc<Context>,
	aggregates: &HashMap<TabletId, TabletAggregate>,
) -> HashSet<TabletId> {
	let mut failed = HashSet::new();
	for (tablet_id, aggregate) in aggregates {
		let Some(peer) = ctx.tablets.peer(tablet_id) else {
			continue;
		};
		if peer.leader_term().is_none() && !ctx.config.enable_local_peer_update {
			continue;
		}

		if aggregate.min_checkpoint.is_max() && aggregate.sdk_min_checkpoint.is_max() {
			// Nobody needs this tablet anymore; failures here are
			// harmless because nothing depends on the release.
			if let Err(e) = peer.apply_retention(crate::tablet::RetentionBarrier::released()) {
				debug!(tablet = %tablet_id, error = %e, "retention release failed");
			}
			continue;
		}

		let barrier = crate::tablet::RetentionBarrier {
			min_replicated_index: checkpoint_index_or_max(aggregate.min_checkpoint),
			intents_min_index: checkpoint_index_or_max(aggregate.sdk_min_checkpoint),
			history_cutoff: aggregate.safe_time,
		};
		if let Err(e) = peer.apply_retention(barrier) {
			warn!(tablet = %tablet_id, error = %e, "failed to push retention barrier");
			failed.insert(tablet_id.clone());
		}
	}
	failed
}

fn checkpoint_index_or_max(op: OpId) -> i64 {
	if op.is_max() || !op.is_valid() {
		i64::MAX
	} else {
		op.index
	}
}

/// Deletes fully-consumed rows, but only for tablets this node leads
/// and whose retention push fully succeeded.
fn delete_consumed_rows(
	ctx: &Arc<Context>,
	rows: &[StateRowKey],
	failed: &HashSet<TabletId>,
) -> Result<usize> {
	let mut deleted = 0;
	for key in rows {
		if failed.contains(&key.tablet_id) {
			continue;
		}
		let is_leader = ctx
			.tablets
			.peer(&key.tablet_id)
			.map(|p| p.leader_term().is_some())
			.unwrap_or(false);
		if !is_leader {
			continue;
		}
		if ctx.state_table.delete(key)? {
			deleted += 1;
		}
		let (stream_id, _) = key.parse_stream();
		let info = ctx.producer_info(&stream_id, &key.tablet_id);
		ctx.store.erase_entry(&info);
		ctx.metrics.remove(&info);
		debug!(tablet = %key.tablet_id, stream = %stream_id, "reclaimed consumed checkpoint row");
	}
	Ok(deleted)
}

/// Refreshes the derived gauges (lag, expiry countdown) from the
/// store's snapshot.
pub(crate) fn update_metrics(ctx: &Arc<Context>) {
	let now = ctx.clock.now_micros();
	let retention_millis = ctx.config.intent_retention.as_millis() as u64;
	for (info, snapshot) in ctx.store.snapshot() {
		let Some(metrics) = ctx.metrics.get(&info) else {
			continue;
		};
		match metrics {
			TabletMetrics::CdcSdk(m) => {
				let idle_millis = now.saturating_sub(snapshot.last_active_micros) / 1_000;
				m.expiry_millis.store(retention_millis.saturating_sub(idle_millis), Ordering::Relaxed);
			}
			TabletMetrics::XCluster(m) => {
				m.last_checkpoint_opid_index.store(snapshot.cdc_state.op_id.index, Ordering::Relaxed);
			}
		}
	}
}

/// Background thread running reconciliation and metrics refresh on
/// their configured intervals. The stop channel makes shutdown prompt
/// regardless of how long those intervals are.
pub(crate) struct ReconcileWorker {
	stop: Sender<()>,
	handle: Option<JoinHandle<()>>,
}

impl ReconcileWorker {
	pub fn spawn(ctx: Arc<Context>) -> Self {
		let (stop, stop_rx) = bounded(1);
		let handle = thread::Builder::new()
			.name("cdc-reconcile".to_string())
			.spawn(move || {
				info!("CDC reconciliation worker started");
				worker_loop(ctx, stop_rx);
				info!("CDC reconciliation worker stopped");
			})
			.expect("failed to spawn CDC reconciliation worker");
		Self {
			stop,
			handle: Some(handle),
		}
	}

	pub fn shutdown(&mut self) {
		let _ = self.stop.try_send(());
		if let Some(handle) = self.handle.take() {
			let _ = handle.join();
		}
	}
}

impl Drop for ReconcileWorker {
	fn drop(&mut self) {
		self.shutdown();
	}
}

fn worker_loop(ctx: Arc<Context>, stop: Receiver<()>) {
	let tick = TICK.min(ctx.config.metrics_interval);
	let mut next_reconcile = Instant::now();
	let mut next_metrics = Instant::now();

	loop {
		match stop.recv_timeout(tick) {
			Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
			Err(RecvTimeoutError::Timeout) => {}
		}
		if !ctx.enabled.load(Ordering::Acquire) {
			continue;
		}
		let now = Instant::now();
		if now >= next_metrics {
			update_metrics(&ctx);
			next_metrics = now + ctx.config.metrics_interval;
		}
		if now >= next_reconcile {
			match reconcile_cycle(&ctx) {
				Ok(outcome) => {
					if outcome.rows_deleted > 0 || !outcome.failed_tablets.is_empty() {
						debug!(
							pushed = outcome.tablets_pushed,
							deleted = outcome.rows_deleted,
							failed = outcome.failed_tablets.len(),
							"reconciliation cycle finished"
						);
					}
				}
				Err(CdcError::NotRunning) => {}
				Err(e) => warn!(error = %e, "reconciliation cycle failed"),
			}
			next_reconcile = now + ctx.config.min_index_update_interval;
		}
	}
}
