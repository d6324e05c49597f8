// Copyright (c) veradb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use std::sync::atomic::{AtomicUsize, Ordering};

/// Non-blocking counted semaphore.
///
/// Callers that fail to acquire must back off (the CDC service turns
/// this into a retryable not-ready error) rather than queue.
pub struct TrySemaphore {
	permits: AtomicUsize,
}

impl TrySemaphore {
	pub fn new(permits: usize) -> Self {
		Self {
			permits: AtomicUsize::new(permits),
		}
	}

	pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
		let mut current = self.permits.load(Ordering::Acquire);
		loop {
			if current == 0 {
				return None;
			}
			match self.permits.compare_exchange_weak(
				current,
				current - 1,
				Ordering::AcqRel,
				Ordering::Acquire,
			) {
				Ok(_) => {
					return Some(SemaphorePermit {
						semaphore: self,
					});
				}
				Err(actual) => current = actual,
			}
		}
	}

	pub fn available(&self) -> usize {
		self.permits.load(Ordering::Acquire)
	}
}

/// Releases its permit on drop.
pub struct SemaphorePermit<'a> {
	semaphore: &'a TrySemaphore,
}

impl Drop for SemaphorePermit<'_> {
	fn drop(&mut self) {
		self.semaphore.permits.fetch_add(1, Ordering::AcqRel);
	}
}
