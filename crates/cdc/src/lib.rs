// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

//! Change data capture for the Veradb storage tier.
//!
//! This crate tracks consumer checkpoints and activity per
//! (stream, tablet) pair, serves the `GetChanges` read path, runs the
//! background checkpoint reconciliation loop that moves retention
//! barriers and reclaims consumed state rows, and caches stream and
//! type metadata.
//!
//! External collaborators (the persisted state table, the catalog,
//! local tablet peers, the row decoder) are injected behind traits;
//! `veradb-testing` provides in-memory implementations.

pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod decoder;
pub mod metrics;
mod reconcile;
pub mod rpc;
mod service;
pub mod state_table;
pub mod stream;
pub mod tablet;
pub mod typecache;

pub use catalog::{CatalogClient, CreateStreamOptions, TabletListEntry};
pub use checkpoint::{CheckpointSnapshot, CheckpointStore, TabletCheckpoint};
pub use config::CdcConfig;
pub use decoder::{ChangeDecoder, ChangeRecord, DecodeRequest, DecodeResponse};
pub use metrics::{CdcSdkTabletMetrics, MetricsRegistry, TabletMetrics, XClusterTabletMetrics};
pub use reconcile::ReconcileOutcome;
pub use rpc::{
	DbStreamInfo, GetChangesRequest, GetChangesResponse, ReplicationDrainStatus,
	SetCheckpointRequest, SetCheckpointResponse, TabletCheckpointPair,
};
pub use service::{CdcDependencies, CdcService};
pub use state_table::{
	ACTIVE_TIME_KEY, SAFE_TIME_KEY, SNAPSHOT_KEY, StateRow, StateRowKey, StateTable,
};
pub use stream::{CheckpointType, RecordFormat, RecordType, SourceType, StreamCache, StreamMetadata};
pub use tablet::{RetentionBarrier, TabletManager, TabletPeer};
pub use typecache::TypeCache;
