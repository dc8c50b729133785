// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

use std::io;

/// Error kinds surfaced by the substrate.
///
/// Allocator-internal conditions are recovered or translated before they
/// cross the heap boundary; everything else propagates unchanged.
#[derive(Debug, thiserror::Error)]
pub enum MemError {
    /// Address space or commit exhausted.
    #[error("no memory: address space or commit charge exhausted")]
    NoMemory,

    /// Zero size, unaligned pointer where alignment is required, unknown
    /// block, or release of an unallocated range.
    #[error("bad parameter")]
    BadParam,

    /// Contradictory flags, e.g. `READ_ONLY` without `RESERVED`.
    #[error("invalid flag combination")]
    InvFlag,

    /// Tentative probe of an uncommitted page. Recovered inside heap
    /// operations, never surfaced to callers that did not ask for it.
    #[error("memory not committed")]
    NotCommitted,

    /// Synchronization contract violation.
    #[error("invalid invocation order")]
    BadInvOrder,

    /// Corrupted bookkeeping detected. Fatal to the current execution
    /// domain only.
    #[error("internal bookkeeping corruption")]
    Internal,

    /// An OS primitive failed in a way that does not map to one of the
    /// kinds above.
    #[error("os failure in {op}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl MemError {
    /// Maps an OS error from an allocation-like call: out-of-memory
    /// conditions become [`MemError::NoMemory`], anything else is kept
    /// with the failing operation name.
    pub(crate) fn from_os(op: &'static str, err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) if code == libc::ENOMEM => MemError::NoMemory,
            _ => MemError::Os { op, source: err },
        }
    }
}

pub type Result<T> = std::result::Result<T, MemError>;
