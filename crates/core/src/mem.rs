// Copyright (c) veradb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use std::{
	collections::HashMap,
	sync::{
		Arc, Weak,
		atomic::{AtomicI64, Ordering},
	},
};

use parking_lot::Mutex;

/// Hierarchical byte accounting.
///
/// Consumption reported to a tracker propagates up the parent chain.
/// Children are held weakly: a tracker disappears from the registry
/// once the last strong reference (the owning cache entry) is gone.
#[derive(Debug)]
pub struct MemTracker {
	id: String,
	consumed: AtomicI64,
	peak: AtomicI64,
	parent: Option<Arc<MemTracker>>,
	children: Mutex<HashMap<String, Weak<MemTracker>>>,
}

impl MemTracker {
	pub fn root(id: impl Into<String>) -> Arc<Self> {
		Arc::new(Self {
			id: id.into(),
			consumed: AtomicI64::new(0),
			peak: AtomicI64::new(0),
			parent: None,
			children: Mutex::new(HashMap::new()),
		})
	}

	/// Returns the child tracker with the given id, creating it if it
	/// does not exist or if the previous instance has been dropped.
	pub fn find_or_create(parent: &Arc<MemTracker>, id: &str) -> Arc<MemTracker> {
		let mut children = parent.children.lock();
		if let Some(existing) = children.get(id).and_then(Weak::upgrade) {
			return existing;
		}
		let child = Arc::new(MemTracker {
			id: id.to_string(),
			consumed: AtomicI64::new(0),
			peak: AtomicI64::new(0),
			parent: Some(parent.clone()),
			children: Mutex::new(HashMap::new()),
		});
		children.insert(id.to_string(), Arc::downgrade(&child));
		child
	}

	pub fn find(parent: &Arc<MemTracker>, id: &str) -> Option<Arc<MemTracker>> {
		parent.children.lock().get(id).and_then(Weak::upgrade)
	}

	pub fn consume(&self, bytes: i64) {
		let mut tracker = Some(self);
		while let Some(t) = tracker {
			let now = t.consumed.fetch_add(bytes, Ordering::SeqCst) + bytes;
			t.peak.fetch_max(now, Ordering::SeqCst);
			tracker = t.parent.as_deref();
		}
	}

	pub fn release(&self, bytes: i64) {
		self.consume(-bytes);
	}

	pub fn consumption(&self) -> i64 {
		self.consumed.load(Ordering::SeqCst)
	}

	pub fn peak_consumption(&self) -> i64 {
		self.peak.load(Ordering::SeqCst)
	}

	pub fn id(&self) -> &str {
		&self.id
	}
}
