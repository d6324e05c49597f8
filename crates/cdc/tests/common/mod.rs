// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use veradb_cdc::{CdcConfig, CdcDependencies, CdcService, CheckpointType, SourceType};
use veradb_core::{Clock, ProducerTabletInfo, TableId};
use veradb_testing::{MemoryCatalog, MemoryStateTable, MockDecoder, MockTabletManager, stream_metadata};

pub const UNIVERSE: &str = "universe-1";

/// A service wired to in-memory collaborators and a mock clock.
pub struct Harness {
	pub service: CdcService,
	pub clock: Clock,
	pub state_table: Arc<MemoryStateTable>,
	pub catalog: Arc<MemoryCatalog>,
	pub tablets: Arc<MockTabletManager>,
	pub decoder: Arc<MockDecoder>,
}

impl Harness {
	pub fn new(config: CdcConfig) -> Self {
		veradb_testing::init_tracing();
		let clock = Clock::mock();
		let state_table = Arc::new(MemoryStateTable::new());
		let catalog = Arc::new(MemoryCatalog::new());
		let tablets = Arc::new(MockTabletManager::new());
		let decoder = Arc::new(MockDecoder::new());
		let service = CdcService::new(
			config,
			clock.clone(),
			UNIVERSE.into(),
			CdcDependencies {
				state_table: state_table.clone(),
				catalog: catalog.clone(),
				tablets: tablets.clone(),
				decoder: decoder.clone(),
			},
		);
		Self {
			service,
			clock,
			state_table,
			catalog,
			tablets,
			decoder,
		}
	}

	/// Registers a stream over one table and spawns a peer per tablet.
	pub fn seed_stream(
		&self,
		stream_id: &str,
		table_id: &str,
		source_type: SourceType,
		checkpoint_type: CheckpointType,
		tablet_ids: &[&str],
	) {
		self.catalog.add_stream(stream_metadata(
			stream_id,
			"ns1",
			vec![TableId::from(table_id)],
			source_type,
			checkpoint_type,
		));
		self.catalog.add_table_with_tablets(table_id, tablet_ids);
		for tablet_id in tablet_ids {
			if self.tablets.get(&(*tablet_id).into()).is_none() {
				self.tablets.add_peer(*tablet_id);
			}
		}
	}

	pub fn info(&self, stream_id: &str, tablet_id: &str) -> ProducerTabletInfo {
		ProducerTabletInfo::new(UNIVERSE.into(), stream_id.into(), tablet_id.into())
	}

	/// A deadline comfortably past the safe-deadline margin.
	pub fn deadline(&self) -> u64 {
		self.clock.now_micros() + Duration::from_secs(60).as_micros() as u64
	}
}

pub fn default_harness() -> Harness {
	Harness::new(CdcConfig::default())
}
