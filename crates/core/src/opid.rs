// Copyright (c) veradb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use std::{
	fmt,
	fmt::{Display, Formatter},
	str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A position in a tablet's replicated log.
///
/// Ordered lexicographically by `(term, index)`. Two sentinels matter
/// throughout the CDC subsystem: [`OpId::MAX`] means "nothing needs to
/// be retained for this consumer" and [`OpId::INVALID`] means the
/// position was never initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId {
	pub term: i64,
	pub index: i64,
}

impl OpId {
	pub const INVALID: OpId = OpId {
		term: -1,
		index: -1,
	};
	pub const MAX: OpId = OpId {
		term: i64::MAX,
		index: i64::MAX,
	};
	pub const MIN: OpId = OpId {
		term: 0,
		index: 0,
	};

	pub const fn new(term: i64, index: i64) -> Self {
		Self {
			term,
			index,
		}
	}

	pub fn is_valid(&self) -> bool {
		self.term >= 0 && self.index >= 0
	}

	pub fn is_max(&self) -> bool {
		*self == Self::MAX
	}

	pub fn is_min(&self) -> bool {
		*self == Self::MIN
	}
}

impl Default for OpId {
	fn default() -> Self {
		Self::INVALID
	}
}

/// The state table stores checkpoints in this form.
impl Display for OpId {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}", self.term, self.index)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed op id '{input}', expected 'term.index'")]
pub struct ParseOpIdError {
	pub input: String,
}

impl FromStr for OpId {
	type Err = ParseOpIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let err = || ParseOpIdError {
			input: s.to_string(),
		};
		let (term, index) = s.split_once('.').ok_or_else(err)?;
		Ok(OpId {
			term: i64::from_str(term).map_err(|_| err())?,
			index: i64::from_str(index).map_err(|_| err())?,
		})
	}
}

impl Serialize for OpId {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		(self.term, self.index).serialize(serializer)
	}
}

impl<'de> Deserialize<'de> for OpId {
	fn deserialize<D>(deserializer: D) -> Result<OpId, D::Error>
	where
		D: Deserializer<'de>,
	{
		let (term, index) = <(i64, i64)>::deserialize(deserializer)?;
		Ok(OpId {
			term,
			index,
		})
	}
}
