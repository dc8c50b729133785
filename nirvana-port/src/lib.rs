// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

//! OS-level address-space port of the Nirvana substrate.
//!
//! Presents a uniform memory API over the host's virtual-memory
//! primitives: block-granular reservation, page-granular commit and
//! protection, and page-file-backed copy-on-write sharing between blocks.
//! Heaps sit on top of this; nothing here knows about allocation units.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

#[cfg(not(unix))]
compile_error!("nirvana-port requires a POSIX host");

mod block;
mod error;
mod mapping;
mod page_state;
mod pagemap;
mod space;

pub use error::{MemError, Result};
pub use page_state::PageState;

use bitflags::bitflags;

/// Allocation granularity: the size of one address-space block. Every
/// mapping covers exactly one block.
pub const BLOCK_SIZE: usize = 0x10000;

/// Commit unit: the hardware page size.
pub fn commit_unit() -> usize {
    page_size::get()
}

pub(crate) fn pages_per_block() -> usize {
    BLOCK_SIZE / commit_unit()
}

bitflags! {
    /// Flags accepted by [`Memory::allocate`] and [`Memory::copy`].
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct AllocFlags: u32 {
        /// Reserve address space without committing pages.
        const RESERVED = 0x0001;
        /// The region becomes read-only on commit. Requires `RESERVED`
        /// at allocation.
        const READ_ONLY = 0x0002;
        /// Committed pages are guaranteed zero.
        const ZERO_INIT = 0x0004;
        /// Fail rather than relocate when the suggested address cannot be
        /// honored.
        const EXACTLY = 0x0008;
        /// The allocator may claim unallocated destination space.
        const ALLOCATE = 0x0010;
        /// Release the source after a copy.
        const RELEASE = 0x0020;
        /// Decommit the source after a copy, keeping its reservation.
        const DECOMMIT = 0x0040;
    }
}

bitflags! {
    /// Capability bits returned by [`Memory::query`] for
    /// [`QueryParam::Flags`].
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Capabilities: u32 {
        const ACCESS_CHECK = 0x0001;
        const HARDWARE_PROTECTION = 0x0002;
        const COPY_ON_WRITE = 0x0004;
        const SPACE_RESERVATION = 0x0008;
    }
}

/// Parameters of [`Memory::query`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QueryParam {
    AllocationUnit,
    SharingUnit,
    CommitUnit,
    OptimalCommitUnit,
    ProtectionUnit,
    Granularity,
    SharingAssociativity,
    Flags,
}

/// The protection-domain memory service.
///
/// All operations are process-global statics over one address-space map,
/// the way a port is: state lives in the map, not in instances.
pub struct Memory;

impl Memory {
    /// Allocates a region: reserves address space and, unless `RESERVED`
    /// is given, commits it. `dst` of null lets the port choose the
    /// placement.
    pub fn allocate(dst: *mut u8, size: usize, flags: AllocFlags) -> Result<*mut u8> {
        if size == 0 {
            return Err(MemError::BadParam);
        }
        if flags.contains(AllocFlags::READ_ONLY) && !flags.contains(AllocFlags::RESERVED) {
            return Err(MemError::InvFlag);
        }
        let space = space::space();
        let ptr = space.reserve(dst as usize, size, flags)?;
        if !flags.contains(AllocFlags::RESERVED) {
            if let Err(e) = space.commit(ptr as usize, size) {
                let _ = space.release(ptr as usize, size);
                return Err(e);
            }
        }
        Ok(ptr)
    }

    /// Releases any mix of reserved and committed ranges. Reservations
    /// outside the range are preserved; the range is rounded outward to
    /// block bounds.
    pub fn release(ptr: *mut u8, size: usize) -> Result<()> {
        space::space().release(ptr as usize, size)
    }

    /// Page-granular commit; idempotent.
    pub fn commit(ptr: *mut u8, size: usize) -> Result<()> {
        space::space().commit(ptr as usize, size)
    }

    /// Page-granular decommit; drops page contents, may unmap an entire
    /// block. Idempotent.
    pub fn decommit(ptr: *mut u8, size: usize) -> Result<()> {
        space::space().decommit(ptr as usize, size)
    }

    /// The sharing primitive. When source and destination can share, the
    /// destination is remapped onto the source's backing and both sides
    /// become copy-on-write; otherwise a byte copy is performed.
    pub fn copy(dst: *mut u8, src: *const u8, size: usize, flags: AllocFlags) -> Result<*mut u8> {
        space::space().copy(dst as usize, src as usize, size, flags)
    }

    pub fn is_readable(ptr: *const u8, size: usize) -> bool {
        space::space().is_readable(ptr as usize, size)
    }

    pub fn is_writable(ptr: *const u8, size: usize) -> bool {
        space::space().is_writable(ptr as usize, size)
    }

    /// True when no page of the range is still connected to a mapping that
    /// another block may view.
    pub fn is_private(ptr: *const u8, size: usize) -> Result<bool> {
        space::space().is_private(ptr as usize, size)
    }

    /// True while the two ranges still read through the same backing and
    /// neither side has been written since the copy.
    pub fn is_copy(p1: *const u8, p2: *const u8, size: usize) -> Result<bool> {
        space::space().is_copy(p1 as usize, p2 as usize, size)
    }

    /// Changes write protection of a committed range.
    pub fn change_protection(ptr: *mut u8, size: usize, read_only: bool) -> Result<()> {
        space::space().change_protection(ptr as usize, size, read_only)
    }

    pub fn query(_ptr: *const u8, q: QueryParam) -> usize {
        match q {
            QueryParam::AllocationUnit
            | QueryParam::SharingUnit
            | QueryParam::Granularity
            | QueryParam::OptimalCommitUnit => BLOCK_SIZE,
            QueryParam::CommitUnit | QueryParam::ProtectionUnit => commit_unit(),
            QueryParam::SharingAssociativity => 1,
            QueryParam::Flags => (Capabilities::ACCESS_CHECK
                | Capabilities::HARDWARE_PROTECTION
                | Capabilities::COPY_ON_WRITE
                | Capabilities::SPACE_RESERVATION)
                .bits() as usize,
        }
    }
}
