// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

//! In-memory checkpoint and active-time tracking for every
//! (stream, tablet) pair this node serves.
//!
//! One lock guards four maps that must stay consistent: the primary
//! checkpoint map, two lookup indexes (by tablet, by stream) and the
//! per-pair decode metadata. All mutation goes through [`Inner`]
//! helpers that touch every index together.

use std::{
	collections::{HashMap, HashSet},
	sync::Arc,
	time::Duration,
};

use parking_lot::RwLock;
use veradb_core::{Clock, HybridTime, MemTracker, OpId, ProducerTabletInfo, StreamId, TableId, TabletId};

/// A checkpoint plus the time it was last moved. `last_update_micros
/// == 0` means "never persisted": the next update must be flushed to
/// the state table regardless of throttling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TabletCheckpoint {
	pub op_id: OpId,
	pub last_update_micros: u64,
}

impl TabletCheckpoint {
	fn unpersisted(op_id: OpId) -> Self {
		Self {
			op_id,
			last_update_micros: 0,
		}
	}

	pub fn expired_at(&self, freshness: Duration, now_micros: u64) -> bool {
		now_micros.saturating_sub(self.last_update_micros) > freshness.as_micros() as u64
	}
}

#[derive(Debug, Clone)]
struct CheckpointEntry {
	/// Mirror of the durable position in the state table.
	cdc_state: TabletCheckpoint,
	/// Last position actually streamed to a consumer.
	sent: TabletCheckpoint,
	/// Last consumer activity, wall-clock micros. Drives SDK stream
	/// expiry.
	last_active_micros: u64,
	mem_tracker: Option<Arc<MemTracker>>,
}

/// Read-only view of one entry, handed out for metrics and
/// reconciliation passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckpointSnapshot {
	pub cdc_state: TabletCheckpoint,
	pub sent: TabletCheckpoint,
	pub last_active_micros: u64,
}

/// Decode-side metadata for one pair: commit timestamp, last streamed
/// position and the schema versions the decoder last emitted with.
#[derive(Debug, Clone, Default)]
struct StateMetadata {
	commit_time: HybridTime,
	last_streamed_op_id: OpId,
	schema_versions: HashMap<TableId, u32>,
}

#[derive(Default)]
struct Inner {
	checkpoints: HashMap<ProducerTabletInfo, CheckpointEntry>,
	by_tablet: HashMap<TabletId, HashSet<ProducerTabletInfo>>,
	by_stream: HashMap<StreamId, HashSet<ProducerTabletInfo>>,
	metadata: HashMap<ProducerTabletInfo, StateMetadata>,
}

impl Inner {
	fn insert_entry(&mut self, info: ProducerTabletInfo, entry: CheckpointEntry) {
		self.by_tablet.entry(info.tablet_id.clone()).or_default().insert(info.clone());
		self.by_stream.entry(info.stream_id.clone()).or_default().insert(info.clone());
		self.checkpoints.insert(info, entry);
	}

	fn remove_entry(&mut self, info: &ProducerTabletInfo) -> bool {
		let removed = self.checkpoints.remove(info).is_some();
		if removed {
			if let Some(set) = self.by_tablet.get_mut(&info.tablet_id) {
				set.remove(info);
				if set.is_empty() {
					self.by_tablet.remove(&info.tablet_id);
				}
			}
			if let Some(set) = self.by_stream.get_mut(&info.stream_id) {
				set.remove(info);
				if set.is_empty() {
					self.by_stream.remove(&info.stream_id);
				}
			}
			self.metadata.remove(info);
		}
		removed
	}
}

pub struct CheckpointStore {
	inner: RwLock<Inner>,
	clock: Clock,
}

impl CheckpointStore {
	pub fn new(clock: Clock) -> Self {
		Self {
			inner: RwLock::new(Inner::default()),
			clock,
		}
	}

	/// The durable checkpoint, served from memory only while the
	/// entry is fresh; stale entries force the caller back to the
	/// state table.
	pub fn last_checkpoint(&self, info: &ProducerTabletInfo, freshness: Duration) -> Option<OpId> {
		let now = self.clock.now_micros();
		let inner = self.inner.read();
		let entry = inner.checkpoints.get(info)?;
		if entry.cdc_state.expired_at(freshness, now) {
			return None;
		}
		Some(entry.cdc_state.op_id)
	}

	/// Records a streamed position and, when `commit` is a real
	/// position, the durable checkpoint. Returns `true` when the
	/// caller must persist the row: at most once per
	/// `update_interval`, and always for an entry that has never been
	/// persisted.
	pub fn update_checkpoint(
		&self,
		info: &ProducerTabletInfo,
		sent: OpId,
		commit: OpId,
		update_interval: Duration,
	) -> bool {
		let now = self.clock.now_micros();
		let mut inner = self.inner.write();
		if !inner.checkpoints.contains_key(info) {
			inner.insert_entry(
				info.clone(),
				CheckpointEntry {
					cdc_state: TabletCheckpoint::unpersisted(OpId::INVALID),
					sent: TabletCheckpoint::unpersisted(OpId::INVALID),
					last_active_micros: now,
					mem_tracker: None,
				},
			);
		}
		let Some(entry) = inner.checkpoints.get_mut(info) else {
			return false;
		};

		entry.sent.op_id = sent;
		entry.sent.last_update_micros = now;

		if commit.index < 0 {
			return false;
		}
		entry.cdc_state.op_id = commit;
		if entry.cdc_state.expired_at(update_interval, now) {
			entry.cdc_state.last_update_micros = now;
			return true;
		}
		false
	}

	/// Minimum streamed position across all active consumers of a
	/// tablet. Entries idle past `freshness` don't hold the minimum
	/// back; with no active consumer the result is [`OpId::MAX`].
	pub fn min_sent_checkpoint_for_tablet(&self, tablet_id: &TabletId, freshness: Duration) -> OpId {
		let now = self.clock.now_micros();
		let inner = self.inner.read();
		let mut min = OpId::MAX;
		if let Some(infos) = inner.by_tablet.get(tablet_id) {
			for info in infos {
				if let Some(entry) = inner.checkpoints.get(info) {
					if !entry.sent.expired_at(freshness, now) && entry.sent.op_id.is_valid() {
						min = min.min(entry.sent.op_id);
					}
				}
			}
		}
		min
	}

	/// Fast path of the tablet-validity check: is the pair already
	/// tracked? `false` sends the caller to the catalog to repopulate
	/// the stream's tablet list.
	pub fn pre_check_tablet_valid_for_stream(&self, info: &ProducerTabletInfo) -> bool {
		self.inner.read().checkpoints.contains_key(info)
	}

	/// Tracks a pair if it isn't tracked yet. The entry starts
	/// unpersisted so the first checkpoint update is flushed.
	pub fn add_tablet_checkpoint(&self, info: &ProducerTabletInfo, op_id: OpId) {
		let now = self.clock.now_micros();
		let mut inner = self.inner.write();
		if inner.checkpoints.contains_key(info) {
			return;
		}
		inner.insert_entry(
			info.clone(),
			CheckpointEntry {
				cdc_state: TabletCheckpoint::unpersisted(op_id),
				sent: TabletCheckpoint::unpersisted(op_id),
				last_active_micros: now,
				mem_tracker: None,
			},
		);
	}

	/// Registers every tablet of a stream and reports whether the
	/// requested tablet was among them.
	pub fn register_stream_tablets(
		&self,
		universe_id: &veradb_core::UniverseId,
		stream_id: &StreamId,
		tablet_ids: &[TabletId],
		requested: &TabletId,
	) -> bool {
		let mut found = false;
		for tablet_id in tablet_ids {
			if tablet_id == requested {
				found = true;
			}
			let info = ProducerTabletInfo::new(
				universe_id.clone(),
				stream_id.clone(),
				tablet_id.clone(),
			);
			self.add_tablet_checkpoint(&info, OpId::INVALID);
		}
		found
	}

	/// Drops every entry for the given tablets, across all streams.
	pub fn erase_tablets(&self, tablet_ids: &[TabletId]) {
		let mut inner = self.inner.write();
		for tablet_id in tablet_ids {
			let infos: Vec<_> =
				inner.by_tablet.get(tablet_id).map(|s| s.iter().cloned().collect()).unwrap_or_default();
			for info in infos {
				inner.remove_entry(&info);
			}
		}
	}

	pub fn erase_entry(&self, info: &ProducerTabletInfo) -> bool {
		self.inner.write().remove_entry(info)
	}

	/// After a split: every stream tracking the parent starts
	/// tracking both children, seeded from the parent's durable
	/// position, and the parent entries go away.
	pub fn add_entries_for_children_on_split(&self, parent: &TabletId, children: &[TabletId]) {
		let mut inner = self.inner.write();
		let parents: Vec<_> =
			inner.by_tablet.get(parent).map(|s| s.iter().cloned().collect()).unwrap_or_default();
		for parent_info in parents {
			let seed = inner
				.checkpoints
				.get(&parent_info)
				.map(|e| e.cdc_state.op_id)
				.unwrap_or(OpId::INVALID);
			for child in children {
				let child_info = ProducerTabletInfo::new(
					parent_info.universe_id.clone(),
					parent_info.stream_id.clone(),
					child.clone(),
				);
				if !inner.checkpoints.contains_key(&child_info) {
					let now = self.clock.now_micros();
					inner.insert_entry(
						child_info,
						CheckpointEntry {
							cdc_state: TabletCheckpoint::unpersisted(seed),
							sent: TabletCheckpoint::unpersisted(seed),
							last_active_micros: now,
							mem_tracker: None,
						},
					);
				}
			}
			inner.remove_entry(&parent_info);
		}
	}

	/// Makes the next `update_checkpoint` report "must persist".
	pub fn force_state_update(&self, info: &ProducerTabletInfo) {
		let mut inner = self.inner.write();
		if let Some(entry) = inner.checkpoints.get_mut(info) {
			entry.cdc_state.last_update_micros = 0;
		}
	}

	/// Memory tracker for a pair, created at most once. The second
	/// check under the write lock closes the race between concurrent
	/// creators.
	pub fn mem_tracker(
		&self,
		info: &ProducerTabletInfo,
		create: impl FnOnce() -> Arc<MemTracker>,
	) -> Arc<MemTracker> {
		if let Some(entry) = self.inner.read().checkpoints.get(info) {
			if let Some(tracker) = &entry.mem_tracker {
				return tracker.clone();
			}
		}
		let mut inner = self.inner.write();
		match inner.checkpoints.get_mut(info) {
			Some(entry) => match &entry.mem_tracker {
				Some(tracker) => tracker.clone(),
				None => {
					let tracker = create();
					entry.mem_tracker = Some(tracker.clone());
					tracker
				}
			},
			None => create(),
		}
	}

	/// Last consumer activity for a pair, served only while the entry
	/// is fresh.
	pub fn last_active_time(&self, info: &ProducerTabletInfo, freshness: Duration) -> Option<u64> {
		let now = self.clock.now_micros();
		let inner = self.inner.read();
		let entry = inner.checkpoints.get(info)?;
		if entry.cdc_state.expired_at(freshness, now) {
			return None;
		}
		Some(entry.last_active_micros)
	}

	/// Refreshes activity for an already-tracked pair.
	pub fn update_active_time(&self, info: &ProducerTabletInfo, active_micros: u64) {
		let mut inner = self.inner.write();
		if let Some(entry) = inner.checkpoints.get_mut(info) {
			entry.last_active_micros = entry.last_active_micros.max(active_micros);
		}
	}

	pub fn update_state_metadata(
		&self,
		info: &ProducerTabletInfo,
		commit_time: HybridTime,
		last_streamed_op_id: OpId,
	) {
		let mut inner = self.inner.write();
		let metadata = inner.metadata.entry(info.clone()).or_default();
		metadata.commit_time = commit_time;
		metadata.last_streamed_op_id = last_streamed_op_id;
	}

	pub fn last_streamed_op_id(&self, info: &ProducerTabletInfo) -> Option<OpId> {
		let inner = self.inner.read();
		let op = inner.metadata.get(info)?.last_streamed_op_id;
		op.is_valid().then_some(op)
	}

	pub fn commit_time(&self, info: &ProducerTabletInfo) -> Option<HybridTime> {
		let inner = self.inner.read();
		let time = inner.metadata.get(info)?.commit_time;
		time.is_valid().then_some(time)
	}

	pub fn schema_version(&self, info: &ProducerTabletInfo, table_id: &TableId) -> Option<u32> {
		self.inner.read().metadata.get(info)?.schema_versions.get(table_id).copied()
	}

	pub fn set_schema_version(&self, info: &ProducerTabletInfo, table_id: &TableId, version: u32) {
		let mut inner = self.inner.write();
		inner.metadata.entry(info.clone()).or_default().schema_versions.insert(table_id.clone(), version);
	}

	/// Forgets cached schema state so the next decode re-emits full
	/// schema information.
	pub fn clear_schema_version(&self, info: &ProducerTabletInfo, table_id: &TableId) {
		let mut inner = self.inner.write();
		if let Some(metadata) = inner.metadata.get_mut(info) {
			metadata.schema_versions.remove(table_id);
		}
	}

	pub fn streams_for_tablet(&self, tablet_id: &TabletId) -> Vec<ProducerTabletInfo> {
		self.inner
			.read()
			.by_tablet
			.get(tablet_id)
			.map(|s| s.iter().cloned().collect())
			.unwrap_or_default()
	}

	pub fn tablets_for_stream(&self, stream_id: &StreamId) -> Vec<ProducerTabletInfo> {
		self.inner
			.read()
			.by_stream
			.get(stream_id)
			.map(|s| s.iter().cloned().collect())
			.unwrap_or_default()
	}

	pub fn snapshot(&self) -> Vec<(ProducerTabletInfo, CheckpointSnapshot)> {
		self.inner
			.read()
			.checkpoints
			.iter()
			.map(|(info, entry)| {
				(
					info.clone(),
					CheckpointSnapshot {
						cdc_state: entry.cdc_state,
						sent: entry.sent,
						last_active_micros: entry.last_active_micros,
					},
				)
			})
			.collect()
	}

	pub fn get(&self, info: &ProducerTabletInfo) -> Option<CheckpointSnapshot> {
		let inner = self.inner.read();
		let entry = inner.checkpoints.get(info)?;
		Some(CheckpointSnapshot {
			cdc_state: entry.cdc_state,
			sent: entry.sent,
			last_active_micros: entry.last_active_micros,
		})
	}

	pub fn len(&self) -> usize {
		self.inner.read().checkpoints.len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.read().checkpoints.is_empty()
	}

	pub fn clear(&self) {
		let mut inner = self.inner.write();
		inner.checkpoints.clear();
		inner.by_tablet.clear();
		inner.by_stream.clear();
		inner.metadata.clear();
	}
}

#[cfg(test)]
mod tests {
	use veradb_core::UniverseId;

	use super::*;

	const INTERVAL: Duration = Duration::from_secs(15);

	fn info(stream: &str, tablet: &str) -> ProducerTabletInfo {
		ProducerTabletInfo::new("u".into(), stream.into(), tablet.into())
	}

	fn store() -> (CheckpointStore, Clock) {
		let clock = Clock::mock();
		(CheckpointStore::new(clock.clone()), clock)
	}

	#[test]
	fn test_first_update_always_persists() {
		let (store, _clock) = store();
		let pair = info("s1", "t1");
		assert!(store.update_checkpoint(&pair, OpId::new(1, 5), OpId::new(1, 5), INTERVAL));
	}

	#[test]
	fn test_persist_throttled_within_interval() {
		let (store, clock) = store();
		let pair = info("s1", "t1");

		assert!(store.update_checkpoint(&pair, OpId::new(1, 5), OpId::new(1, 5), INTERVAL));
		clock.advance(Duration::from_secs(1));
		assert!(!store.update_checkpoint(&pair, OpId::new(1, 6), OpId::new(1, 6), INTERVAL));
		// The in-memory position still moved.
		assert_eq!(store.last_checkpoint(&pair, INTERVAL), Some(OpId::new(1, 6)));

		clock.advance(INTERVAL);
		assert!(store.update_checkpoint(&pair, OpId::new(1, 7), OpId::new(1, 7), INTERVAL));
	}

	#[test]
	fn test_negative_commit_index_never_persists() {
		let (store, clock) = store();
		let pair = info("s1", "t1");
		assert!(!store.update_checkpoint(&pair, OpId::new(1, 5), OpId::INVALID, INTERVAL));
		clock.advance(INTERVAL * 2);
		assert!(!store.update_checkpoint(&pair, OpId::new(1, 6), OpId::INVALID, INTERVAL));
		// Sent moved, durable checkpoint never initialized.
		assert_eq!(store.get(&pair).unwrap().sent.op_id, OpId::new(1, 6));
		assert_eq!(store.get(&pair).unwrap().cdc_state.op_id, OpId::INVALID);
	}

	#[test]
	fn test_force_state_update_bypasses_throttle() {
		let (store, clock) = store();
		let pair = info("s1", "t1");
		assert!(store.update_checkpoint(&pair, OpId::new(1, 1), OpId::new(1, 1), INTERVAL));
		clock.advance(Duration::from_secs(1));
		store.force_state_update(&pair);
		assert!(store.update_checkpoint(&pair, OpId::new(1, 2), OpId::new(1, 2), INTERVAL));
	}

	#[test]
	fn test_min_sent_ignores_expired_entries() {
		let (store, clock) = store();
		let slow = info("s-slow", "t1");
		let fast = info("s-fast", "t1");

		store.update_checkpoint(&slow, OpId::new(1, 3), OpId::new(1, 3), INTERVAL);
		clock.advance(Duration::from_secs(120));
		store.update_checkpoint(&fast, OpId::new(1, 9), OpId::new(1, 9), INTERVAL);

		// Both active within a 10 minute window.
		assert_eq!(
			store.min_sent_checkpoint_for_tablet(&"t1".into(), Duration::from_secs(600)),
			OpId::new(1, 3)
		);
		// The slow consumer idled out of a 60 second window.
		assert_eq!(
			store.min_sent_checkpoint_for_tablet(&"t1".into(), Duration::from_secs(60)),
			OpId::new(1, 9)
		);
	}

	#[test]
	fn test_min_sent_with_no_consumers_is_max() {
		let (store, _clock) = store();
		assert!(store.min_sent_checkpoint_for_tablet(&"t1".into(), INTERVAL).is_max());
	}

	#[test]
	fn test_indexes_stay_consistent_after_erase() {
		let (store, _clock) = store();
		let a = info("s1", "t1");
		let b = info("s2", "t1");
		let c = info("s1", "t2");
		for pair in [&a, &b, &c] {
			store.add_tablet_checkpoint(pair, OpId::MIN);
		}

		assert_eq!(store.streams_for_tablet(&"t1".into()).len(), 2);
		assert_eq!(store.tablets_for_stream(&"s1".into()).len(), 2);

		assert!(store.erase_entry(&a));
		assert!(!store.erase_entry(&a));
		assert_eq!(store.streams_for_tablet(&"t1".into()), vec![b.clone()]);
		assert_eq!(store.tablets_for_stream(&"s1".into()), vec![c.clone()]);

		store.erase_tablets(&["t1".into(), "t2".into()]);
		assert!(store.is_empty());
		assert!(store.streams_for_tablet(&"t1".into()).is_empty());
		assert!(store.tablets_for_stream(&"s1".into()).is_empty());
	}

	#[test]
	fn test_split_seeds_children_and_drops_parent() {
		let (store, _clock) = store();
		let parent_s1 = info("s1", "parent");
		let parent_s2 = info("s2", "parent");
		store.update_checkpoint(&parent_s1, OpId::new(2, 40), OpId::new(2, 40), INTERVAL);
		store.update_checkpoint(&parent_s2, OpId::new(2, 35), OpId::new(2, 35), INTERVAL);

		store.add_entries_for_children_on_split(&"parent".into(), &["child-a".into(), "child-b".into()]);

		assert!(store.streams_for_tablet(&"parent".into()).is_empty());
		for stream in ["s1", "s2"] {
			for child in ["child-a", "child-b"] {
				let snapshot = store.get(&info(stream, child)).unwrap();
				let expected = if stream == "s1" {
					OpId::new(2, 40)
				} else {
					OpId::new(2, 35)
				};
				assert_eq!(snapshot.cdc_state.op_id, expected);
				// Children must persist on their first update.
				assert_eq!(snapshot.cdc_state.last_update_micros, 0);
			}
		}
	}

	#[test]
	fn test_register_stream_tablets_reports_membership() {
		let (store, _clock) = store();
		let universe = UniverseId::from("u");
		let stream = StreamId::from("s1");
		let tablets: Vec<TabletId> = vec!["t1".into(), "t2".into()];

		assert!(store.register_stream_tablets(&universe, &stream, &tablets, &"t2".into()));
		assert!(!store.register_stream_tablets(&universe, &stream, &tablets, &"t9".into()));
		assert_eq!(store.tablets_for_stream(&stream).len(), 2);
	}

	#[test]
	fn test_active_time_freshness() {
		let (store, clock) = store();
		let pair = info("s1", "t1");
		store.update_checkpoint(&pair, OpId::new(1, 1), OpId::new(1, 1), INTERVAL);
		let observed = store.last_active_time(&pair, INTERVAL).unwrap();
		assert_eq!(observed, clock.now_micros());

		store.update_active_time(&pair, clock.now_micros() + 5);
		assert_eq!(store.last_active_time(&pair, INTERVAL), Some(clock.now_micros() + 5));

		// Entry went stale: callers must consult the state table.
		clock.advance(INTERVAL * 3);
		assert_eq!(store.last_active_time(&pair, INTERVAL), None);
	}

	#[test]
	fn test_mem_tracker_created_once() {
		let (store, _clock) = store();
		let pair = info("s1", "t1");
		store.add_tablet_checkpoint(&pair, OpId::MIN);

		let root = MemTracker::root("cdc");
		let a = store.mem_tracker(&pair, || MemTracker::find_or_create(&root, "t1"));
		let b = store.mem_tracker(&pair, || panic!("must reuse the cached tracker"));
		assert!(Arc::ptr_eq(&a, &b));
	}

	#[test]
	fn test_state_metadata_round_trip() {
		let (store, _clock) = store();
		let pair = info("s1", "t1");
		assert_eq!(store.last_streamed_op_id(&pair), None);

		store.update_state_metadata(&pair, HybridTime::from_micros(99), OpId::new(3, 14));
		assert_eq!(store.last_streamed_op_id(&pair), Some(OpId::new(3, 14)));
		assert_eq!(store.commit_time(&pair), Some(HybridTime::from_micros(99)));

		store.set_schema_version(&pair, &"tbl".into(), 4);
		assert_eq!(store.schema_version(&pair, &"tbl".into()), Some(4));
		store.clear_schema_version(&pair, &"tbl".into());
		assert_eq!(store.schema_version(&pair, &"tbl".into()), None);
	}
}
