// Copyright (c) veradb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use std::{
	fmt,
	fmt::{Display, Formatter},
	sync::{
		Arc,
		atomic::{AtomicU64, Ordering},
	},
	time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// Number of low bits reserved for the logical component of a hybrid
/// timestamp; the physical component is wall-clock microseconds.
const LOGICAL_BITS: u32 = 12;

/// A hybrid logical timestamp. `0` is the invalid sentinel.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HybridTime(pub u64);

impl HybridTime {
	pub const INVALID: HybridTime = HybridTime(0);

	pub const fn from_micros(micros: u64) -> Self {
		Self(micros << LOGICAL_BITS)
	}

	pub const fn physical_micros(&self) -> u64 {
		self.0 >> LOGICAL_BITS
	}

	pub fn is_valid(&self) -> bool {
		self.0 != 0
	}
}

impl Display for HybridTime {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		Display::fmt(&self.0, f)
	}
}

/// Injectable time source.
///
/// Production code uses [`Clock::system`]; tests use [`Clock::mock`]
/// and drive it with [`Clock::advance`] / [`Clock::set_micros`]. All
/// CDC freshness arithmetic (active-time expiry, persist throttling)
/// goes through the clock so it can be tested deterministically.
#[derive(Clone)]
pub struct Clock {
	inner: Arc<ClockInner>,
}

enum ClockInner {
	System,
	Mock(AtomicU64),
}

/// Mock clocks start well past the epoch so a zero micros value can
/// keep meaning "never".
const MOCK_EPOCH_MICROS: u64 = 1_700_000_000_000_000;

impl Clock {
	pub fn system() -> Self {
		Self {
			inner: Arc::new(ClockInner::System),
		}
	}

	pub fn mock() -> Self {
		Self {
			inner: Arc::new(ClockInner::Mock(AtomicU64::new(MOCK_EPOCH_MICROS))),
		}
	}

	/// Wall-clock microseconds since the epoch.
	pub fn now_micros(&self) -> u64 {
		match self.inner.as_ref() {
			ClockInner::System => SystemTime::now()
				.duration_since(UNIX_EPOCH)
				.map(|d| d.as_micros() as u64)
				.unwrap_or(0),
			ClockInner::Mock(micros) => micros.load(Ordering::SeqCst),
		}
	}

	pub fn now(&self) -> HybridTime {
		HybridTime::from_micros(self.now_micros())
	}

	/// Advances a mock clock; has no effect on the system clock.
	pub fn advance(&self, delta: Duration) {
		if let ClockInner::Mock(micros) = self.inner.as_ref() {
			micros.fetch_add(delta.as_micros() as u64, Ordering::SeqCst);
		}
	}

	/// Pins a mock clock to an absolute value; has no effect on the
	/// system clock.
	pub fn set_micros(&self, value: u64) {
		if let ClockInner::Mock(micros) = self.inner.as_ref() {
			micros.store(value, Ordering::SeqCst);
		}
	}

	/// Blocks on the system clock; a mock clock advances instead, so
	/// retry loops bounded by [`Clock::now_micros`] terminate in tests.
	pub fn sleep(&self, duration: Duration) {
		match self.inner.as_ref() {
			ClockInner::System => std::thread::sleep(duration),
			ClockInner::Mock(micros) => {
				micros.fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
			}
		}
	}
}

impl fmt::Debug for Clock {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self.inner.as_ref() {
			ClockInner::System => f.write_str("Clock::System"),
			ClockInner::Mock(micros) => {
				write!(f, "Clock::Mock({})", micros.load(Ordering::SeqCst))
			}
		}
	}
}
