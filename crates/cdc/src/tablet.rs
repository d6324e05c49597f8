// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

//! Local tablet collaborators. The consensus implementation behind
//! these traits is out of scope; the CDC service only needs leadership
//! facts, log positions and the ability to move retention barriers.

use std::sync::Arc;

use veradb_core::{HybridTime, OpId, Result, TabletId};

/// Retention positions pushed to a tablet by the reconciliation loop
/// or after a checkpoint advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionBarrier {
	/// Minimum log index that must stay readable.
	pub min_replicated_index: i64,
	/// Minimum index whose intents must be kept for SDK streams.
	pub intents_min_index: i64,
	/// History cutoff; [`HybridTime::INVALID`] leaves it unchanged.
	pub history_cutoff: HybridTime,
}

impl RetentionBarrier {
	/// Barrier that releases all retention for a tablet (every
	/// consumer is done with it).
	pub fn released() -> Self {
		Self {
			min_replicated_index: i64::MAX,
			intents_min_index: i64::MAX,
			history_cutoff: HybridTime::INVALID,
		}
	}
}

pub trait TabletPeer: Send + Sync {
	fn tablet_id(&self) -> TabletId;

	/// `Some(term)` while this peer is the acting leader.
	fn leader_term(&self) -> Option<i64>;

	/// Whether an acting leader has finished applying its term's
	/// pending entries. A leader that is still catching up must not
	/// serve changes yet; callers back off and retry instead of
	/// redirecting.
	fn is_leader_ready(&self) -> bool;

	/// Position of the last entry in the local log.
	fn latest_op_id(&self) -> OpId;

	/// Leader safe time; reads up to this time are consistent.
	fn safe_time(&self) -> HybridTime;

	fn apply_retention(&self, barrier: RetentionBarrier) -> Result<()>;

	/// Whether the local log can still serve entries from `index`.
	fn log_available_from(&self, index: i64) -> bool;
}

pub trait TabletManager: Send + Sync {
	fn peer(&self, tablet_id: &TabletId) -> Option<Arc<dyn TabletPeer>>;

	/// Tablets this node currently leads.
	fn leader_tablet_ids(&self) -> Vec<TabletId>;
}
