// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

//! The CDC service: wiring, lifecycle and shared per-node state. The
//! consumer-facing state machine lives in `get_changes`, the
//! administrative surface in `admin`.

mod admin;
mod get_changes;

use std::{
	collections::HashSet,
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
};

use parking_lot::RwLock;
use tracing::info;
use veradb_core::{Clock, MemTracker, ProducerTabletInfo, Result, StreamId, TabletId, TrySemaphore, UniverseId};

use crate::{
	catalog::CatalogClient,
	checkpoint::CheckpointStore,
	config::CdcConfig,
	decoder::ChangeDecoder,
	metrics::MetricsRegistry,
	reconcile::{self, ReconcileOutcome, ReconcileWorker},
	state_table::{StateRowKey, StateTable},
	stream::StreamCache,
	tablet::TabletManager,
	typecache::TypeCache,
};

/// External collaborators injected at construction.
pub struct CdcDependencies {
	pub state_table: Arc<dyn StateTable>,
	pub catalog: Arc<dyn CatalogClient>,
	pub tablets: Arc<dyn TabletManager>,
	pub decoder: Arc<dyn ChangeDecoder>,
}

/// Everything request handlers and the background worker share.
pub(crate) struct Context {
	pub config: CdcConfig,
	pub clock: Clock,
	pub universe_id: UniverseId,
	pub state_table: Arc<dyn StateTable>,
	pub catalog: Arc<dyn CatalogClient>,
	pub tablets: Arc<dyn TabletManager>,
	pub decoder: Arc<dyn ChangeDecoder>,
	pub store: CheckpointStore,
	pub streams: StreamCache,
	pub types: TypeCache,
	pub metrics: MetricsRegistry,
	pub semaphore: TrySemaphore,
	pub enabled: AtomicBool,
	/// Streams whose replication is administratively paused. Polls
	/// against them respond with the unchanged position.
	pub paused_streams: RwLock<HashSet<StreamId>>,
	pub mem_root: Arc<MemTracker>,
}

impl Context {
	pub fn producer_info(&self, stream_id: &StreamId, tablet_id: &TabletId) -> ProducerTabletInfo {
		ProducerTabletInfo::new(self.universe_id.clone(), stream_id.clone(), tablet_id.clone())
	}

	pub fn row_key(&self, info: &ProducerTabletInfo) -> StateRowKey {
		StateRowKey::new(info.tablet_id.clone(), &info.stream_id)
	}
}

pub struct CdcService {
	ctx: Arc<Context>,
	worker: Option<ReconcileWorker>,
}

impl CdcService {
	pub fn new(config: CdcConfig, clock: Clock, universe_id: UniverseId, deps: CdcDependencies) -> Self {
		let permits = config.get_changes_permits();
		let store = CheckpointStore::new(clock.clone());
		let ctx = Arc::new(Context {
			config,
			clock,
			universe_id,
			state_table: deps.state_table,
			catalog: deps.catalog,
			tablets: deps.tablets,
			decoder: deps.decoder,
			store,
			streams: StreamCache::new(),
			types: TypeCache::new(),
			metrics: MetricsRegistry::new(),
			semaphore: TrySemaphore::new(permits),
			enabled: AtomicBool::new(true),
			paused_streams: RwLock::new(HashSet::new()),
			mem_root: MemTracker::root("cdc"),
		});
		Self {
			ctx,
			worker: None,
		}
	}

	/// Spawns the background reconciliation worker. Idempotent.
	pub fn start(&mut self) {
		if self.worker.is_none() {
			self.worker = Some(ReconcileWorker::spawn(self.ctx.clone()));
			info!("CDC service started");
		}
	}

	pub fn is_running(&self) -> bool {
		self.ctx.enabled.load(Ordering::Acquire)
	}

	/// Stops serving, joins the worker, then drops in-memory state.
	/// The order matters: no request or worker cycle may observe a
	/// half-cleared store.
	pub fn shutdown(&mut self) {
		if !self.ctx.enabled.swap(false, Ordering::AcqRel) {
			return;
		}
		if let Some(mut worker) = self.worker.take() {
			worker.shutdown();
		}
		self.ctx.store.clear();
		self.ctx.streams.clear();
		self.ctx.types.clear();
		self.ctx.metrics.clear();
		self.ctx.paused_streams.write().clear();
		info!("CDC service stopped");
	}

	/// Runs one reconciliation cycle synchronously. The background
	/// worker calls the same path on its own schedule.
	pub fn reconcile_once(&self) -> Result<ReconcileOutcome> {
		reconcile::reconcile_cycle(&self.ctx)
	}

	/// Reconciles a single tablet's rows, used after an on-demand
	/// checkpoint change.
	pub fn reconcile_tablet(&self, tablet_id: &TabletId) -> Result<ReconcileOutcome> {
		reconcile::reconcile_tablet(&self.ctx, tablet_id)
	}

	/// Pauses replication for a stream: consumers keep polling but get
	/// empty responses echoing their position until [`Self::resume_stream`].
	pub fn pause_stream(&self, stream_id: &StreamId) {
		if self.ctx.paused_streams.write().insert(stream_id.clone()) {
			info!(stream = %stream_id, "replication paused");
		}
	}

	pub fn resume_stream(&self, stream_id: &StreamId) {
		if self.ctx.paused_streams.write().remove(stream_id) {
			info!(stream = %stream_id, "replication resumed");
		}
	}

	pub fn is_stream_paused(&self, stream_id: &StreamId) -> bool {
		self.ctx.paused_streams.read().contains(stream_id)
	}

	pub fn metrics(&self) -> &MetricsRegistry {
		&self.ctx.metrics
	}

	pub(crate) fn ctx(&self) -> &Arc<Context> {
		&self.ctx
	}

	#[doc(hidden)]
	pub fn checkpoint_store(&self) -> &crate::checkpoint::CheckpointStore {
		&self.ctx.store
	}
}

impl Drop for CdcService {
	fn drop(&mut self) {
		self.shutdown();
	}
}
