// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

/// Installs a test-friendly tracing subscriber once per process.
/// Output goes through the libtest capture machinery; set `RUST_LOG`
/// to see it for failing tests.
pub fn init_tracing() {
	INIT.get_or_init(|| {
		let _ = tracing_subscriber::fmt()
			.with_env_filter(EnvFilter::from_default_env())
			.with_test_writer()
			.try_init();
	});
}
