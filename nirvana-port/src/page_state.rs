// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

/// Per-page state of a mapped block.
///
/// The state encodes both access rights and sharing lineage, which is what
/// lets the port answer `is_private`, `is_copy` and `is_readable` without a
/// separate bookkeeping table. "Was shared" means the page has been shared
/// at least once; it may or may not still be shared.
///
/// The post-copy-on-write `RW_UNMAPPED` / `RO_UNMAPPED` states of the model
/// are not stored: a `*_MAPPED_SHARED` page whose backing has privatized
/// (hardware copy-on-write on the private view) is *reported* unmapped, see
/// [`crate::pagemap`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum PageState {
    /// Page not committed (entire block never was committed here).
    NotCommitted = 0,
    /// Decommitted; contents dropped, mapping possibly retained.
    Decommitted,
    /// Mapped read-write, never shared.
    RwMappedPrivate,
    /// Mapped read-write, was shared; writes privatize through CoW.
    RwMappedShared,
    /// Mapped read-only, never shared.
    RoMappedPrivate,
    /// Mapped read-only, was shared.
    RoMappedShared,
}

impl PageState {
    /// The page is accessible at all.
    pub fn is_committed(self) -> bool {
        !matches!(self, PageState::NotCommitted | PageState::Decommitted)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, PageState::RwMappedPrivate | PageState::RwMappedShared)
    }

    /// Carries sharing lineage: the page may still be connected to a
    /// mapping some other block views.
    pub fn may_be_shared(self) -> bool {
        matches!(
            self,
            PageState::RwMappedShared | PageState::RoMappedShared | PageState::Decommitted
        )
    }

    /// State after entering sharing.
    pub fn shared(self) -> PageState {
        match self {
            PageState::RwMappedPrivate => PageState::RwMappedShared,
            PageState::RoMappedPrivate => PageState::RoMappedShared,
            other => other,
        }
    }

    /// State after a remap disconnects the block from shared lineage.
    pub fn privatized(self) -> PageState {
        match self {
            PageState::RwMappedShared => PageState::RwMappedPrivate,
            PageState::RoMappedShared => PageState::RoMappedPrivate,
            other => other,
        }
    }
}
