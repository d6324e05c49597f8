// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

use std::{
	collections::HashMap,
	sync::{
		Arc,
		atomic::{AtomicBool, AtomicI64, Ordering},
	},
};

use parking_lot::Mutex;
use veradb_cdc::{RetentionBarrier, TabletManager, TabletPeer};
use veradb_core::{CdcError, HybridTime, OpId, Result, TabletId};

/// Scriptable tablet peer: leadership, log position and safe time are
/// settable, applied retention barriers are recorded.
pub struct MockTabletPeer {
	tablet_id: TabletId,
	leader_term: Mutex<Option<i64>>,
	latest_op_id: Mutex<OpId>,
	safe_time: Mutex<HybridTime>,
	log_start_index: AtomicI64,
	leader_ready: AtomicBool,
	fail_retention: AtomicBool,
	barriers: Mutex<Vec<RetentionBarrier>>,
}

impl MockTabletPeer {
	pub fn new(tablet_id: impl Into<TabletId>) -> Self {
		Self {
			tablet_id: tablet_id.into(),
			leader_term: Mutex::new(Some(1)),
			latest_op_id: Mutex::new(OpId::MIN),
			safe_time: Mutex::new(HybridTime::INVALID),
			log_start_index: AtomicI64::new(0),
			leader_ready: AtomicBool::new(true),
			fail_retention: AtomicBool::new(false),
			barriers: Mutex::new(Vec::new()),
		}
	}

	pub fn set_leader_term(&self, term: Option<i64>) {
		*self.leader_term.lock() = term;
	}

	pub fn set_latest_op_id(&self, op_id: OpId) {
		*self.latest_op_id.lock() = op_id;
	}

	pub fn set_safe_time(&self, safe_time: HybridTime) {
		*self.safe_time.lock() = safe_time;
	}

	/// First log index still available locally.
	pub fn set_log_start_index(&self, index: i64) {
		self.log_start_index.store(index, Ordering::SeqCst);
	}

	pub fn set_leader_ready(&self, ready: bool) {
		self.leader_ready.store(ready, Ordering::SeqCst);
	}

	pub fn set_fail_retention(&self, fail: bool) {
		self.fail_retention.store(fail, Ordering::SeqCst);
	}

	pub fn barriers(&self) -> Vec<RetentionBarrier> {
		self.barriers.lock().clone()
	}

	pub fn last_barrier(&self) -> Option<RetentionBarrier> {
		self.barriers.lock().last().copied()
	}
}

impl TabletPeer for MockTabletPeer {
	fn tablet_id(&self) -> TabletId {
		self.tablet_id.clone()
	}

	fn leader_term(&self) -> Option<i64> {
		*self.leader_term.lock()
	}

	fn is_leader_ready(&self) -> bool {
		self.leader_ready.load(Ordering::SeqCst)
	}

	fn latest_op_id(&self) -> OpId {
		*self.latest_op_id.lock()
	}

	fn safe_time(&self) -> HybridTime {
		*self.safe_time.lock()
	}

	fn apply_retention(&self, barrier: RetentionBarrier) -> Result<()> {
		if self.fail_retention.load(Ordering::SeqCst) {
			return Err(CdcError::internal("retention push failed"));
		}
		self.barriers.lock().push(barrier);
		Ok(())
	}

	fn log_available_from(&self, index: i64) -> bool {
		index >= self.log_start_index.load(Ordering::SeqCst)
	}
}

#[derive(Default)]
pub struct MockTabletManager {
	peers: Mutex<HashMap<TabletId, Arc<MockTabletPeer>>>,
}

impl MockTabletManager {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_peer(&self, tablet_id: impl Into<TabletId>) -> Arc<MockTabletPeer> {
		let peer = Arc::new(MockTabletPeer::new(tablet_id));
		self.peers.lock().insert(peer.tablet_id.clone(), peer.clone());
		peer
	}

	pub fn remove_peer(&self, tablet_id: &TabletId) {
		self.peers.lock().remove(tablet_id);
	}

	pub fn get(&self, tablet_id: &TabletId) -> Option<Arc<MockTabletPeer>> {
		self.peers.lock().get(tablet_id).cloned()
	}
}

impl TabletManager for MockTabletManager {
	fn peer(&self, tablet_id: &TabletId) -> Option<Arc<dyn TabletPeer>> {
		self.peers.lock().get(tablet_id).map(|p| p.clone() as Arc<dyn TabletPeer>)
	}

	fn leader_tablet_ids(&self) -> Vec<TabletId> {
		self.peers
			.lock()
			.values()
			.filter(|p| p.leader_term.lock().is_some())
			.map(|p| p.tablet_id.clone())
			.collect()
	}
}
