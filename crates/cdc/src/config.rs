// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

use std::time::Duration;

/// Tuning knobs for the CDC service. Defaults match production
/// deployments; tests shrink the intervals and inject a mock clock.
#[derive(Debug, Clone)]
pub struct CdcConfig {
	/// Budget for a consumer-facing read; also feeds the safe
	/// deadline computation.
	pub read_timeout: Duration,
	/// Budget for writes against the state table.
	pub write_timeout: Duration,
	/// Minimum spacing between persisted checkpoint updates for one
	/// (stream, tablet) pair.
	pub checkpoint_update_interval: Duration,
	/// Spacing of the metrics refresh inside the background loop.
	pub metrics_interval: Duration,
	/// Spacing of full checkpoint reconciliation passes.
	pub min_index_update_interval: Duration,
	/// SDK stream expiry window: a stream with no activity for this
	/// long stops holding resources on a tablet.
	pub intent_retention: Duration,
	/// Serve reads from the in-memory checkpoint store when fresh,
	/// skipping the state table.
	pub enable_state_table_caching: bool,
	/// Cache stream tablet lists instead of re-listing per request.
	pub enable_tablet_caching: bool,
	/// Fraction of `worker_budget` reserved for non-CDC work; the
	/// remainder sizes the GetChanges admission semaphore.
	pub get_changes_reservation_ratio: f64,
	/// Number of request worker threads the host process runs.
	pub worker_budget: usize,
	/// Seed bootstrap state rows for each table on its own thread.
	pub parallelize_bootstrap: bool,
	/// Push retention barriers to local non-leader peers as well.
	pub enable_local_peer_update: bool,
	/// Fraction of `read_timeout` shaved off the rpc deadline before
	/// handing it to the decoder.
	pub safe_deadline_ratio: f64,
	/// Move the log retention barrier on checkpoint advance.
	pub enable_log_retention_by_op_idx: bool,
}

impl CdcConfig {
	/// Number of concurrent GetChanges calls admitted.
	pub fn get_changes_permits(&self) -> usize {
		let reserved = (self.worker_budget as f64 * self.get_changes_reservation_ratio) as usize;
		self.worker_budget.saturating_sub(reserved).max(1)
	}

	/// How much earlier than the rpc deadline the decoder must stop.
	pub fn safe_deadline_margin(&self) -> Duration {
		self.read_timeout.mul_f64(self.safe_deadline_ratio)
	}
}

impl Default for CdcConfig {
	fn default() -> Self {
		Self {
			read_timeout: Duration::from_secs(30),
			write_timeout: Duration::from_secs(30),
			checkpoint_update_interval: Duration::from_secs(15),
			metrics_interval: Duration::from_secs(15),
			min_index_update_interval: Duration::from_secs(60),
			intent_retention: Duration::from_secs(4 * 60 * 60),
			enable_state_table_caching: true,
			enable_tablet_caching: true,
			get_changes_reservation_ratio: 0.10,
			worker_budget: 128,
			parallelize_bootstrap: true,
			enable_local_peer_update: true,
			safe_deadline_ratio: 0.10,
			enable_log_retention_by_op_idx: true,
		}
	}
}
