// Copyright (c) veradb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

use std::{
	fmt,
	fmt::{Display, Formatter},
};

use crate::{NamespaceId, OpId, StreamId, TableId, TabletId};

/// Transport-level error codes carried in CDC response envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
	InvalidRequest,
	NotRunning,
	TabletNotFound,
	TableNotFound,
	LeaderNotReady,
	NotLeader,
	TabletSplit,
	CheckpointTooOld,
	InternalError,
}

impl Display for ErrorCode {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			ErrorCode::InvalidRequest => f.write_str("INVALID_REQUEST"),
			ErrorCode::NotRunning => f.write_str("NOT_RUNNING"),
			ErrorCode::TabletNotFound => f.write_str("TABLET_NOT_FOUND"),
			ErrorCode::TableNotFound => f.write_str("TABLE_NOT_FOUND"),
			ErrorCode::LeaderNotReady => f.write_str("LEADER_NOT_READY"),
			ErrorCode::NotLeader => f.write_str("NOT_LEADER"),
			ErrorCode::TabletSplit => f.write_str("TABLET_SPLIT"),
			ErrorCode::CheckpointTooOld => f.write_str("CHECKPOINT_TOO_OLD"),
			ErrorCode::InternalError => f.write_str("INTERNAL_ERROR"),
		}
	}
}

/// Which per-namespace type metadata cache went stale during decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCacheKind {
	EnumLabels,
	CompositeAttributes,
}

impl Display for TypeCacheKind {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			TypeCacheKind::EnumLabels => f.write_str("enum label"),
			TypeCacheKind::CompositeAttributes => f.write_str("composite attribute"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CdcError {
	#[error("invalid request: {message}")]
	InvalidRequest {
		message: String,
	},

	#[error("CDC service is not running")]
	NotRunning,

	#[error("tablet '{tablet_id}' not found")]
	TabletNotFound {
		tablet_id: TabletId,
	},

	#[error("table '{table_id}' not found")]
	TableNotFound {
		table_id: TableId,
	},

	#[error("stream '{stream_id}' not found")]
	StreamNotFound {
		stream_id: StreamId,
	},

	#[error("not ready to serve changes: {message}")]
	LeaderNotReady {
		message: String,
	},

	#[error("not the leader for tablet '{tablet_id}'")]
	NotLeader {
		tablet_id: TabletId,
	},

	#[error("tablet '{tablet_id}' has been split")]
	TabletSplit {
		tablet_id: TabletId,
	},

	#[error("checkpoint {checkpoint} is no longer available for tablet '{tablet_id}'")]
	CheckpointTooOld {
		tablet_id: TabletId,
		checkpoint: OpId,
	},

	#[error("stream '{stream_id}' expired for tablet '{tablet_id}'")]
	StreamExpired {
		stream_id: StreamId,
		tablet_id: TabletId,
	},

	#[error("{kind} cache is stale for namespace '{namespace_id}'")]
	TypeCacheMiss {
		kind: TypeCacheKind,
		namespace_id: NamespaceId,
	},

	#[error("state table operation failed: {message}")]
	StateTable {
		message: String,
	},

	#[error("{message}")]
	Internal {
		message: String,
	},
}

impl CdcError {
	pub fn invalid_request(message: impl Into<String>) -> Self {
		Self::InvalidRequest {
			message: message.into(),
		}
	}

	pub fn leader_not_ready(message: impl Into<String>) -> Self {
		Self::LeaderNotReady {
			message: message.into(),
		}
	}

	pub fn state_table(message: impl Into<String>) -> Self {
		Self::StateTable {
			message: message.into(),
		}
	}

	pub fn internal(message: impl Into<String>) -> Self {
		Self::Internal {
			message: message.into(),
		}
	}

	pub fn code(&self) -> ErrorCode {
		match self {
			CdcError::InvalidRequest {
				..
			} => ErrorCode::InvalidRequest,
			CdcError::NotRunning => ErrorCode::NotRunning,
			CdcError::TabletNotFound {
				..
			} => ErrorCode::TabletNotFound,
			CdcError::TableNotFound {
				..
			} => ErrorCode::TableNotFound,
			CdcError::LeaderNotReady {
				..
			} => ErrorCode::LeaderNotReady,
			CdcError::NotLeader {
				..
			} => ErrorCode::NotLeader,
			CdcError::TabletSplit {
				..
			} => ErrorCode::TabletSplit,
			CdcError::CheckpointTooOld {
				..
			} => ErrorCode::CheckpointTooOld,
			// Consumers retry an expired stream the same way they
			// retry a bad request: re-resolve and start over.
			CdcError::StreamExpired {
				..
			} => ErrorCode::InvalidRequest,
			CdcError::StreamNotFound {
				..
			} => ErrorCode::InternalError,
			CdcError::TypeCacheMiss {
				..
			} => ErrorCode::InternalError,
			CdcError::StateTable {
				..
			} => ErrorCode::InternalError,
			CdcError::Internal {
				..
			} => ErrorCode::InternalError,
		}
	}
}

pub type Result<T> = std::result::Result<T, CdcError>;
