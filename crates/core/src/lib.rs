// Copyright (c) veradb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

//! Shared primitives for the Veradb storage tier: replication
//! positions, hybrid timestamps, identifier newtypes, the injectable
//! clock, the CDC error taxonomy, memory accounting and admission
//! control helpers.

mod error;
mod id;
mod mem;
mod opid;
mod semaphore;
mod time;

pub use error::{CdcError, ErrorCode, Result, TypeCacheKind};
pub use id::{NamespaceId, ProducerTabletInfo, StreamId, TableId, TabletId, UniverseId};
pub use mem::MemTracker;
pub use opid::{OpId, ParseOpIdError};
pub use semaphore::{SemaphorePermit, TrySemaphore};
pub use time::{Clock, HybridTime};
