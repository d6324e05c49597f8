// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

mod common;

use std::{
	collections::HashMap,
	sync::{Arc, atomic::Ordering, mpsc},
	thread,
	time::Duration,
};

use common::{Harness, default_harness};
use veradb_cdc::{
	CdcConfig, CdcDependencies, CdcService, ChangeDecoder, CheckpointType, DecodeRequest,
	DecodeResponse, GetChangesRequest, SourceType, StateRowKey, TabletListEntry,
};
use veradb_core::{CdcError, Clock, ErrorCode, HybridTime, OpId, Result, TypeCacheKind};
use veradb_testing::{
	MemoryCatalog, MemoryStateTable, MockDecoder, MockTabletManager, MockTabletPeer, stream_metadata,
};

fn request(h: &Harness, stream: &str, tablet: &str) -> GetChangesRequest {
	GetChangesRequest::new(stream.into(), tablet.into(), h.deadline())
}

#[test]
fn test_first_poll_streams_and_persists_checkpoint() {
	let h = default_harness();
	h.seed_stream("s1", "tbl1", SourceType::XCluster, CheckpointType::Implicit, &["t1"]);
	let commit_time = HybridTime::from_micros(h.clock.now_micros());
	h.decoder.push_batch(OpId::new(1, 5), OpId::new(1, 5), 5, commit_time);

	let response = h.service.get_changes(request(&h, "s1", "t1")).unwrap();
	assert_eq!(response.records.len(), 5);
	assert_eq!(response.checkpoint, OpId::new(1, 5));

	// No prior state anywhere: the decode starts from the beginning.
	assert_eq!(h.decoder.requests()[0].from_op_id, OpId::MIN);

	// The very first checkpoint always reaches the state table.
	let row = h.state_table.row(&StateRowKey::new("t1".into(), &"s1".into())).unwrap();
	assert_eq!(row.checkpoint_op_id().unwrap(), OpId::new(1, 5));

	// Log retention followed the minimum streamed position.
	let barrier = h.tablets.get(&"t1".into()).unwrap().last_barrier().unwrap();
	assert_eq!(barrier.min_replicated_index, 5);

	let metrics = h.service.metrics().get(&h.info("s1", "t1")).unwrap();
	let xcluster = metrics.as_xcluster().unwrap();
	assert_eq!(xcluster.last_read_opid_index.load(Ordering::Relaxed), 5);
	assert!(xcluster.rpc_payload_bytes_responded.load(Ordering::Relaxed) > 0);
}

#[test]
fn test_rejected_after_shutdown() {
	let mut h = default_harness();
	h.seed_stream("s1", "tbl1", SourceType::XCluster, CheckpointType::Implicit, &["t1"]);
	h.service.shutdown();
	assert!(!h.service.is_running());

	let err = h.service.get_changes(request(&h, "s1", "t1")).unwrap_err();
	assert!(matches!(err, CdcError::NotRunning));
	assert_eq!(err.code(), ErrorCode::NotRunning);
}

#[test]
fn test_empty_ids_rejected() {
	let h = default_harness();
	let err = h.service.get_changes(request(&h, "", "t1")).unwrap_err();
	assert_eq!(err.code(), ErrorCode::InvalidRequest);
	let err = h.service.get_changes(request(&h, "s1", "")).unwrap_err();
	assert_eq!(err.code(), ErrorCode::InvalidRequest);
}

#[test]
fn test_unknown_stream_rejected() {
	let h = default_harness();
	let err = h.service.get_changes(request(&h, "ghost", "t1")).unwrap_err();
	assert!(matches!(err, CdcError::StreamNotFound { .. }));
}

#[test]
fn test_tablet_outside_stream_rejected() {
	let h = default_harness();
	h.seed_stream("s1", "tbl1", SourceType::XCluster, CheckpointType::Implicit, &["t1"]);
	let err = h.service.get_changes(request(&h, "s1", "t9")).unwrap_err();
	assert_eq!(err.code(), ErrorCode::InvalidRequest);
}

#[test]
fn test_split_parent_detected_during_validation() {
	let h = default_harness();
	h.catalog.add_stream(stream_metadata(
		"s1",
		"ns1",
		vec!["tbl1".into()],
		SourceType::XCluster,
		CheckpointType::Implicit,
	));
	h.catalog.add_table(
		"tbl1",
		vec![
			TabletListEntry {
				tablet_id: "t-child-a".into(),
				table_id: "tbl1".into(),
				split_parent: Some("t-parent".into()),
			},
			TabletListEntry {
				tablet_id: "t-child-b".into(),
				table_id: "tbl1".into(),
				split_parent: Some("t-parent".into()),
			},
		],
	);

	let err = h.service.get_changes(request(&h, "s1", "t-parent")).unwrap_err();
	assert!(matches!(err, CdcError::TabletSplit { .. }));
	assert_eq!(err.code(), ErrorCode::TabletSplit);
}

#[test]
fn test_non_leader_rejected() {
	let h = default_harness();
	h.seed_stream("s1", "tbl1", SourceType::XCluster, CheckpointType::Implicit, &["t1"]);
	h.tablets.get(&"t1".into()).unwrap().set_leader_term(None);

	let err = h.service.get_changes(request(&h, "s1", "t1")).unwrap_err();
	assert!(matches!(err, CdcError::NotLeader { .. }));
	assert_eq!(h.decoder.request_count(), 0);
}

#[test]
fn test_leader_still_catching_up_rejected() {
	let h = default_harness();
	h.seed_stream("s1", "tbl1", SourceType::XCluster, CheckpointType::Implicit, &["t1"]);
	h.tablets.get(&"t1".into()).unwrap().set_leader_ready(false);

	// Holding the lease is not enough; a backoff-retry error, not a
	// redirect.
	let err = h.service.get_changes(request(&h, "s1", "t1")).unwrap_err();
	assert_eq!(err.code(), ErrorCode::LeaderNotReady);
	assert_eq!(h.decoder.request_count(), 0);

	h.tablets.get(&"t1".into()).unwrap().set_leader_ready(true);
	h.service.get_changes(request(&h, "s1", "t1")).unwrap();
}

#[test]
fn test_paused_stream_echoes_position_without_decoding() {
	let h = default_harness();
	h.seed_stream("s1", "tbl1", SourceType::XCluster, CheckpointType::Implicit, &["t1"]);
	h.decoder.push_batch(OpId::new(1, 4), OpId::new(1, 4), 1, HybridTime::from_micros(1));
	h.service.get_changes(request(&h, "s1", "t1")).unwrap();

	h.service.pause_stream(&"s1".into());
	assert!(h.service.is_stream_paused(&"s1".into()));

	let response = h.service.get_changes(request(&h, "s1", "t1")).unwrap();
	assert!(response.records.is_empty());
	assert_eq!(response.checkpoint, OpId::new(1, 4));
	// The decoder never ran and nothing moved durably.
	assert_eq!(h.decoder.request_count(), 1);
	let row = h.state_table.row(&StateRowKey::new("t1".into(), &"s1".into())).unwrap();
	assert_eq!(row.checkpoint_op_id().unwrap(), OpId::new(1, 4));

	h.service.resume_stream(&"s1".into());
	h.decoder.push_batch(OpId::new(1, 7), OpId::new(1, 7), 1, HybridTime::from_micros(1));
	let response = h.service.get_changes(request(&h, "s1", "t1")).unwrap();
	assert_eq!(response.checkpoint, OpId::new(1, 7));
}

#[test]
fn test_insufficient_deadline_rejected() {
	let h = default_harness();
	h.seed_stream("s1", "tbl1", SourceType::XCluster, CheckpointType::Implicit, &["t1"]);

	// Less budget than the safe deadline margin shaves off.
	let mut req = request(&h, "s1", "t1");
	req.deadline_micros = h.clock.now_micros() + Duration::from_secs(1).as_micros() as u64;
	let err = h.service.get_changes(req).unwrap_err();
	assert_eq!(err.code(), ErrorCode::LeaderNotReady);
	assert_eq!(h.decoder.request_count(), 0);
}

#[test]
fn test_expired_sdk_stream_rejected() {
	let h = default_harness();
	h.seed_stream("s1", "tbl1", SourceType::CdcSdk, CheckpointType::Implicit, &["t1"]);
	let key = StateRowKey::new("t1".into(), &"s1".into());
	let mut row = veradb_cdc::StateRow::new(key, OpId::new(1, 2));
	row.set_active_time(h.clock.now_micros());
	h.state_table.put(row);

	// Idle past the intent retention window.
	h.clock.advance(Duration::from_secs(5 * 60 * 60));

	let err = h.service.get_changes(request(&h, "s1", "t1")).unwrap_err();
	assert!(matches!(err, CdcError::StreamExpired { .. }));
	assert_eq!(err.code(), ErrorCode::InvalidRequest);
	assert_eq!(h.decoder.request_count(), 0);
}

#[test]
fn test_sdk_uninitialized_checkpoint_rejected() {
	let h = default_harness();
	h.seed_stream("s1", "tbl1", SourceType::CdcSdk, CheckpointType::Implicit, &["t1"]);

	// No durable position anywhere: an SDK consumer must set a
	// checkpoint or take a snapshot before it can stream.
	let err = h.service.get_changes(request(&h, "s1", "t1")).unwrap_err();
	assert_eq!(err.code(), ErrorCode::InvalidRequest);
	assert_eq!(h.decoder.request_count(), 0);

	// An uninitialized row is no better than a missing one.
	h.state_table.put(veradb_cdc::StateRow::new(
		StateRowKey::new("t1".into(), &"s1".into()),
		OpId::INVALID,
	));
	let err = h.service.get_changes(request(&h, "s1", "t1")).unwrap_err();
	assert_eq!(err.code(), ErrorCode::InvalidRequest);
	assert_eq!(h.decoder.request_count(), 0);
}

#[test]
fn test_xcluster_uninitialized_checkpoint_streams_from_start() {
	let h = default_harness();
	h.seed_stream("s1", "tbl1", SourceType::XCluster, CheckpointType::Implicit, &["t1"]);

	h.service.get_changes(request(&h, "s1", "t1")).unwrap();
	assert_eq!(h.decoder.requests()[0].from_op_id, OpId::MIN);
}

#[test]
fn test_sdk_poll_refreshes_active_time() {
	let h = default_harness();
	h.seed_stream("s1", "tbl1", SourceType::CdcSdk, CheckpointType::Implicit, &["t1"]);
	h.state_table.put(veradb_cdc::StateRow::new(
		StateRowKey::new("t1".into(), &"s1".into()),
		OpId::new(1, 1),
	));
	let commit_time = HybridTime::from_micros(h.clock.now_micros());
	h.decoder.push_batch(OpId::new(1, 3), OpId::new(1, 3), 3, commit_time);

	h.service.get_changes(request(&h, "s1", "t1")).unwrap();

	let snapshot = h.service.checkpoint_store().get(&h.info("s1", "t1")).unwrap();
	assert_eq!(snapshot.last_active_micros, h.clock.now_micros());

	let row = h.state_table.row(&StateRowKey::new("t1".into(), &"s1".into())).unwrap();
	assert_eq!(row.active_time(), Some(h.clock.now_micros()));
	assert_eq!(row.safe_time(), Some(commit_time));
}

#[test]
fn test_stale_type_cache_refreshed_and_retried_once() {
	let h = default_harness();
	h.seed_stream("s1", "tbl1", SourceType::CdcSdk, CheckpointType::Implicit, &["t1"]);
	h.state_table.put(veradb_cdc::StateRow::new(
		StateRowKey::new("t1".into(), &"s1".into()),
		OpId::new(1, 1),
	));
	h.catalog.set_enum_labels("ns1", HashMap::from([(1, "red".to_string())]));

	h.decoder.push_response(Err(CdcError::TypeCacheMiss {
		kind: TypeCacheKind::EnumLabels,
		namespace_id: "ns1".into(),
	}));
	h.decoder.push_batch(OpId::new(1, 2), OpId::new(1, 2), 1, HybridTime::from_micros(1));

	let response = h.service.get_changes(request(&h, "s1", "t1")).unwrap();
	assert_eq!(response.records.len(), 1);
	assert_eq!(h.decoder.request_count(), 2);
}

#[test]
fn test_repeated_type_cache_miss_surfaces() {
	let h = default_harness();
	h.seed_stream("s1", "tbl1", SourceType::CdcSdk, CheckpointType::Implicit, &["t1"]);
	h.state_table.put(veradb_cdc::StateRow::new(
		StateRowKey::new("t1".into(), &"s1".into()),
		OpId::new(1, 1),
	));
	for _ in 0..2 {
		h.decoder.push_response(Err(CdcError::TypeCacheMiss {
			kind: TypeCacheKind::CompositeAttributes,
			namespace_id: "ns1".into(),
		}));
	}

	let err = h.service.get_changes(request(&h, "s1", "t1")).unwrap_err();
	assert!(matches!(err, CdcError::TypeCacheMiss { .. }));
	// One refresh, one retry, no third attempt.
	assert_eq!(h.decoder.request_count(), 2);
}

#[test]
fn test_split_seeds_children_and_surfaces_error() {
	let h = default_harness();
	h.seed_stream("s1", "tbl1", SourceType::XCluster, CheckpointType::Implicit, &["t-parent"]);
	h.decoder.push_batch(OpId::new(1, 5), OpId::new(1, 5), 1, HybridTime::from_micros(1));
	h.service.get_changes(request(&h, "s1", "t-parent")).unwrap();

	// The tablet splits: the catalog now lists only the children.
	h.catalog.add_table(
		"tbl1",
		vec![
			TabletListEntry {
				tablet_id: "t-child-a".into(),
				table_id: "tbl1".into(),
				split_parent: Some("t-parent".into()),
			},
			TabletListEntry {
				tablet_id: "t-child-b".into(),
				table_id: "tbl1".into(),
				split_parent: Some("t-parent".into()),
			},
		],
	);
	h.decoder.push_response(Err(CdcError::TabletSplit {
		tablet_id: "t-parent".into(),
	}));

	let err = h.service.get_changes(request(&h, "s1", "t-parent")).unwrap_err();
	assert!(matches!(err, CdcError::TabletSplit { .. }));

	// Children resume from the parent's durable position.
	for child in ["t-child-a", "t-child-b"] {
		let row = h.state_table.row(&StateRowKey::new(child.into(), &"s1".into())).unwrap();
		assert_eq!(row.checkpoint_op_id().unwrap(), OpId::new(1, 5));
		assert!(h.service.checkpoint_store().get(&h.info("s1", child)).is_some());
	}
	// The parent entry is gone and its row is marked fully consumed,
	// so the polling topology hands over to the children.
	assert!(h.service.checkpoint_store().get(&h.info("s1", "t-parent")).is_none());
	let parent_row = h.state_table.row(&StateRowKey::new("t-parent".into(), &"s1".into())).unwrap();
	assert_eq!(parent_row.checkpoint_op_id().unwrap(), OpId::MAX);
}

struct TermFlippingDecoder {
	peer: Arc<MockTabletPeer>,
	inner: MockDecoder,
}

impl ChangeDecoder for TermFlippingDecoder {
	fn decode(&self, request: DecodeRequest<'_>) -> Result<DecodeResponse> {
		self.peer.set_leader_term(Some(7));
		self.inner.decode(request)
	}
}

#[test]
fn test_leadership_change_during_decode_rejected() {
	veradb_testing::init_tracing();
	let clock = Clock::mock();
	let state_table = Arc::new(MemoryStateTable::new());
	let catalog = Arc::new(MemoryCatalog::new());
	let tablets = Arc::new(MockTabletManager::new());
	let peer = tablets.add_peer("t1");
	catalog.add_stream(stream_metadata(
		"s1",
		"ns1",
		vec!["tbl1".into()],
		SourceType::XCluster,
		CheckpointType::Implicit,
	));
	catalog.add_table_with_tablets("tbl1", &["t1"]);
	let service = CdcService::new(
		CdcConfig::default(),
		clock.clone(),
		common::UNIVERSE.into(),
		CdcDependencies {
			state_table: state_table.clone(),
			catalog,
			tablets,
			decoder: Arc::new(TermFlippingDecoder {
				peer,
				inner: MockDecoder::new(),
			}),
		},
	);

	let deadline = clock.now_micros() + Duration::from_secs(60).as_micros() as u64;
	let err = service
		.get_changes(GetChangesRequest::new("s1".into(), "t1".into(), deadline))
		.unwrap_err();
	assert!(matches!(err, CdcError::NotLeader { .. }));
	// Nothing advanced behind the lost lease.
	assert!(state_table.is_empty());
}

struct BlockingDecoder {
	entered: std::sync::Mutex<mpsc::Sender<()>>,
	release: std::sync::Mutex<mpsc::Receiver<()>>,
}

impl ChangeDecoder for BlockingDecoder {
	fn decode(&self, request: DecodeRequest<'_>) -> Result<DecodeResponse> {
		let _ = self.entered.lock().unwrap().send(());
		let _ = self.release.lock().unwrap().recv();
		Ok(DecodeResponse {
			records: Vec::new(),
			sent_op_id: request.from_op_id,
			commit_op_id: request.from_op_id,
			safe_hybrid_time: None,
			snapshot_key: None,
		})
	}
}

#[test]
fn test_admission_limit_rejects_overload() {
	veradb_testing::init_tracing();
	let (entered_tx, entered_rx) = mpsc::channel();
	let (release_tx, release_rx) = mpsc::channel();

	let clock = Clock::mock();
	let catalog = Arc::new(MemoryCatalog::new());
	let tablets = Arc::new(MockTabletManager::new());
	tablets.add_peer("t1");
	catalog.add_stream(stream_metadata(
		"s1",
		"ns1",
		vec!["tbl1".into()],
		SourceType::XCluster,
		CheckpointType::Implicit,
	));
	catalog.add_table_with_tablets("tbl1", &["t1"]);
	let service = CdcService::new(
		CdcConfig {
			worker_budget: 1,
			get_changes_reservation_ratio: 0.0,
			..Default::default()
		},
		clock.clone(),
		common::UNIVERSE.into(),
		CdcDependencies {
			state_table: Arc::new(MemoryStateTable::new()),
			catalog,
			tablets,
			decoder: Arc::new(BlockingDecoder {
				entered: std::sync::Mutex::new(entered_tx),
				release: std::sync::Mutex::new(release_rx),
			}),
		},
	);

	let deadline = clock.now_micros() + Duration::from_secs(60).as_micros() as u64;
	let req = GetChangesRequest::new("s1".into(), "t1".into(), deadline);

	thread::scope(|scope| {
		let first = req.clone();
		let handle = scope.spawn(|| service.get_changes(first));
		entered_rx.recv().unwrap();

		// The single permit is held by the in-flight call.
		let err = service.get_changes(req.clone()).unwrap_err();
		assert_eq!(err.code(), ErrorCode::LeaderNotReady);

		release_tx.send(()).unwrap();
		handle.join().unwrap().unwrap();
	});
}
