// Copyright (c) veradb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use std::{
	fmt,
	fmt::{Display, Formatter},
};

use serde::{Deserialize, Serialize};

macro_rules! string_id {
	($(#[$doc:meta])* $name:ident) => {
		$(#[$doc])*
		#[repr(transparent)]
		#[derive(
			Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
		)]
		pub struct $name(pub String);

		impl $name {
			pub fn new(value: impl Into<String>) -> Self {
				Self(value.into())
			}

			pub fn as_str(&self) -> &str {
				&self.0
			}
		}

		impl Display for $name {
			fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
				Display::fmt(&self.0, f)
			}
		}

		impl From<&str> for $name {
			fn from(value: &str) -> Self {
				Self(value.to_string())
			}
		}

		impl From<String> for $name {
			fn from(value: String) -> Self {
				Self(value)
			}
		}
	};
}

string_id! {
	/// Identifies a tablet (a shard of a table's key range).
	TabletId
}

string_id! {
	/// Identifies a CDC stream.
	StreamId
}

string_id! {
	TableId
}

string_id! {
	NamespaceId
}

string_id! {
	/// Identifies the producer universe a stream belongs to.
	UniverseId
}

/// Key for all per-(stream, tablet) CDC bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProducerTabletInfo {
	pub universe_id: UniverseId,
	pub stream_id: StreamId,
	pub tablet_id: TabletId,
}

impl ProducerTabletInfo {
	pub fn new(universe_id: UniverseId, stream_id: StreamId, tablet_id: TabletId) -> Self {
		Self {
			universe_id,
			stream_id,
			tablet_id,
		}
	}
}

impl Display for ProducerTabletInfo {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}:{}", self.universe_id, self.stream_id, self.tablet_id)
	}
}
