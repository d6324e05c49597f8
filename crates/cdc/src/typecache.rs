// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 Veradb

//! Per-namespace type metadata caches (enum labels, composite type
//! attributes) consumed by the row decoder.
//!
//! The decoder reports staleness with a structured
//! `CdcError::TypeCacheMiss`; the service then calls [`TypeCache::refresh`]
//! and retries the decode exactly once.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tracing::debug;
use veradb_core::{NamespaceId, Result, TypeCacheKind};

use crate::catalog::CatalogClient;

pub type EnumLabelMap = HashMap<u32, String>;
pub type CompositeAttributeMap = HashMap<u32, Vec<String>>;

pub struct TypeCache {
	enum_labels: RwLock<HashMap<NamespaceId, Arc<EnumLabelMap>>>,
	composite_attributes: RwLock<HashMap<NamespaceId, Arc<CompositeAttributeMap>>>,
}

impl TypeCache {
	pub fn new() -> Self {
		Self {
			enum_labels: RwLock::new(HashMap::new()),
			composite_attributes: RwLock::new(HashMap::new()),
		}
	}

	pub fn enum_labels(
		&self,
		catalog: &dyn CatalogClient,
		namespace_id: &NamespaceId,
	) -> Result<Arc<EnumLabelMap>> {
		if let Some(labels) = self.enum_labels.read().get(namespace_id) {
			return Ok(labels.clone());
		}
		let fetched = Arc::new(catalog.enum_labels(namespace_id)?);
		let mut cache = self.enum_labels.write();
		Ok(cache.entry(namespace_id.clone()).or_insert(fetched).clone())
	}

	pub fn composite_attributes(
		&self,
		catalog: &dyn CatalogClient,
		namespace_id: &NamespaceId,
	) -> Result<Arc<CompositeAttributeMap>> {
		if let Some(attributes) = self.composite_attributes.read().get(namespace_id) {
			return Ok(attributes.clone());
		}
		let fetched = Arc::new(catalog.composite_attributes(namespace_id)?);
		let mut cache = self.composite_attributes.write();
		Ok(cache.entry(namespace_id.clone()).or_insert(fetched).clone())
	}

	/// Drops and repopulates one cache for one namespace.
	pub fn refresh(
		&self,
		catalog: &dyn CatalogClient,
		kind: TypeCacheKind,
		namespace_id: &NamespaceId,
	) -> Result<()> {
		debug!(namespace = %namespace_id, ?kind, "refreshing type metadata cache");
		match kind {
			TypeCacheKind::EnumLabels => {
				let fetched = Arc::new(catalog.enum_labels(namespace_id)?);
				self.enum_labels.write().insert(namespace_id.clone(), fetched);
			}
			TypeCacheKind::CompositeAttributes => {
				let fetched = Arc::new(catalog.composite_attributes(namespace_id)?);
				self.composite_attributes.write().insert(namespace_id.clone(), fetched);
			}
		}
		Ok(())
	}

	pub fn clear(&self) {
		self.enum_labels.write().clear();
		self.composite_attributes.write().clear();
	}
}

impl Default for TypeCache {
	fn default() -> Self {
		Self::new()
	}
}
