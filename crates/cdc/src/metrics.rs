// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

//! Per-(stream, tablet) counters. Plain atomics behind a shared
//! registry; scrape/export layers live outside this crate.

use std::{
	collections::HashMap,
	sync::{
		Arc,
		atomic::{AtomicI64, AtomicU64},
	},
};

use parking_lot::RwLock;
use veradb_core::ProducerTabletInfo;

use crate::stream::SourceType;

/// Counters for a cross-cluster replication consumer.
#[derive(Debug, Default)]
pub struct XClusterTabletMetrics {
	pub last_read_opid_index: AtomicI64,
	pub last_checkpoint_opid_index: AtomicI64,
	pub async_replication_sent_lag_micros: AtomicU64,
	pub rpc_payload_bytes_responded: AtomicU64,
	pub last_getchanges_time_micros: AtomicU64,
}

/// Counters for an SDK consumer.
#[derive(Debug, Default)]
pub struct CdcSdkTabletMetrics {
	pub sent_lag_micros: AtomicU64,
	pub traffic_sent_bytes: AtomicU64,
	pub change_event_count: AtomicU64,
	/// Milliseconds until the stream expires for this tablet.
	pub expiry_millis: AtomicU64,
	pub last_sent_physical_time_micros: AtomicU64,
}

#[derive(Debug, Clone)]
pub enum TabletMetrics {
	XCluster(Arc<XClusterTabletMetrics>),
	CdcSdk(Arc<CdcSdkTabletMetrics>),
}

impl TabletMetrics {
	pub fn as_xcluster(&self) -> Option<&XClusterTabletMetrics> {
		match self {
			TabletMetrics::XCluster(m) => Some(m),
			TabletMetrics::CdcSdk(_) => None,
		}
	}

	pub fn as_cdc_sdk(&self) -> Option<&CdcSdkTabletMetrics> {
		match self {
			TabletMetrics::CdcSdk(m) => Some(m),
			TabletMetrics::XCluster(_) => None,
		}
	}
}

/// Registry entry names follow the `CDCMetrics:{stream}:{tablet}`
/// convention so memory attribution and dashboards can group by
/// stream.
pub fn metrics_id(info: &ProducerTabletInfo) -> String {
	format!("CDCMetrics:{}:{}", info.stream_id, info.tablet_id)
}

pub struct MetricsRegistry {
	entries: RwLock<HashMap<ProducerTabletInfo, TabletMetrics>>,
}

impl MetricsRegistry {
	pub fn new() -> Self {
		Self {
			entries: RwLock::new(HashMap::new()),
		}
	}

	pub fn get_or_create(&self, info: &ProducerTabletInfo, source_type: SourceType) -> TabletMetrics {
		if let Some(metrics) = self.entries.read().get(info) {
			return metrics.clone();
		}
		let mut entries = self.entries.write();
		entries.entry(info.clone())
			.or_insert_with(|| match source_type {
				SourceType::XCluster => {
					TabletMetrics::XCluster(Arc::new(XClusterTabletMetrics::default()))
				}
				SourceType::CdcSdk => {
					TabletMetrics::CdcSdk(Arc::new(CdcSdkTabletMetrics::default()))
				}
			})
			.clone()
	}

	pub fn get(&self, info: &ProducerTabletInfo) -> Option<TabletMetrics> {
		self.entries.read().get(info).cloned()
	}

	pub fn remove(&self, info: &ProducerTabletInfo) -> bool {
		self.entries.write().remove(info).is_some()
	}

	pub fn len(&self) -> usize {
		self.entries.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.read().is_empty()
	}

	pub fn clear(&self) {
		self.entries.write().clear();
	}
}

impl Default for MetricsRegistry {
	fn default() -> Self {
		Self::new()
	}
}
