// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

//! Per-block mapping record and state transitions.
//!
//! A block is either reserved (no record) or mapped as a view of one
//! [`Mapping`]. A direct view (`MAP_SHARED` of the block's own mapping) is
//! what a never-shared committed block uses: writes land in the backing.
//! A copy-on-write view (`MAP_PRIVATE`) is what sharing produces; several
//! blocks may view one mapping, and hardware CoW privatizes written pages.
//!
//! All methods here run under the owning slot's busy hand-off, so the
//! record is accessed exclusively.

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::Arc;

use nix::sys::mman::{madvise, mprotect, MapFlags, MmapAdvise, ProtFlags};

use crate::error::{MemError, Result};
use crate::mapping::Mapping;
use crate::page_state::PageState;
use crate::pagemap;
use crate::{commit_unit, pages_per_block, BLOCK_SIZE};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum View {
    /// `MAP_SHARED` view of the block's own mapping; never shared.
    Direct,
    /// `MAP_PRIVATE` copy-on-write view; the mapping may have partners.
    Cow,
}

pub(crate) struct BlockRec {
    pub(crate) mapping: Arc<Mapping>,
    pub(crate) view: View,
    /// Reservation-level read-only protection.
    pub(crate) ro: bool,
    pub(crate) pages: Vec<PageState>,
}

/// Inclusive-exclusive page index range within one block.
pub(crate) type PageRange = std::ops::Range<usize>;

/// Page range covered by the byte range `[off, off + len)`, rounded
/// outward.
pub(crate) fn pages_outward(off: usize, len: usize) -> PageRange {
    let page = commit_unit();
    off / page..(off + len + page - 1) / page
}

/// Page range fully contained in the byte range, rounded inward.
pub(crate) fn pages_inward(off: usize, len: usize) -> PageRange {
    let page = commit_unit();
    let begin = (off + page - 1) / page;
    let end = (off + len) / page;
    begin..end.max(begin)
}

fn prot_for(state: PageState) -> ProtFlags {
    match state {
        PageState::NotCommitted | PageState::Decommitted => ProtFlags::PROT_NONE,
        PageState::RwMappedPrivate | PageState::RwMappedShared => {
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        }
        PageState::RoMappedPrivate | PageState::RoMappedShared => ProtFlags::PROT_READ,
    }
}

/// Maps `mapping` over the whole block at `base` with read-write access;
/// callers narrow protections afterwards. `MAP_FIXED` replaces whatever
/// view is there atomically.
pub(crate) fn map_view(base: *mut u8, mapping: &Mapping, view: View) -> Result<()> {
    let kind = match view {
        View::Direct => MapFlags::MAP_SHARED,
        View::Cow => MapFlags::MAP_PRIVATE,
    };
    // SAFETY: `base` is a block this address space owns; MAP_FIXED within
    // owned space is the designed replacement primitive.
    unsafe {
        nix::sys::mman::mmap(
            NonZeroUsize::new(base as usize),
            NonZeroUsize::new(BLOCK_SIZE).unwrap_or_else(|| unreachable!()),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_FIXED | kind,
            mapping.fd(),
            0,
        )
    }
    .map_err(|e| MemError::from_os("mmap view", e.into()))?;
    Ok(())
}

/// Replaces the block's view with an inaccessible reservation.
pub(crate) fn reserve_fixed(base: *mut u8) -> Result<()> {
    // SAFETY: replaces a view within owned space.
    unsafe {
        nix::sys::mman::mmap_anonymous(
            NonZeroUsize::new(base as usize),
            NonZeroUsize::new(BLOCK_SIZE).unwrap_or_else(|| unreachable!()),
            ProtFlags::PROT_NONE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED | MapFlags::MAP_NORESERVE,
        )
    }
    .map_err(|e| MemError::from_os("mmap reserve", e.into()))?;
    Ok(())
}

fn protect_run(base: *mut u8, first_page: usize, count: usize, prot: ProtFlags) -> Result<()> {
    let page = commit_unit();
    let addr = base as usize + first_page * page;
    // SAFETY: range lies within the freshly mapped block.
    unsafe {
        mprotect(
            NonNull::new(addr as *mut _).ok_or(MemError::Internal)?,
            count * page,
            prot,
        )
    }
    .map_err(|e| MemError::from_os("mprotect", e.into()))
}

impl BlockRec {
    /// Commits a fresh block over a plain reservation.
    pub(crate) fn create_committed(base: *mut u8, range: PageRange, ro: bool) -> Result<BlockRec> {
        let mapping = Arc::new(Mapping::new_block()?);
        map_view(base, &mapping, View::Direct)?;
        let committed = if ro {
            PageState::RoMappedPrivate
        } else {
            PageState::RwMappedPrivate
        };
        let pages: Vec<PageState> = (0..pages_per_block())
            .map(|i| {
                if range.contains(&i) {
                    committed
                } else {
                    PageState::NotCommitted
                }
            })
            .collect();
        let rec = BlockRec {
            mapping,
            view: View::Direct,
            ro,
            pages,
        };
        rec.apply_protections(base)?;
        Ok(rec)
    }

    /// Builds a copy-on-write partner view of `mapping` at `base`. Pages
    /// outside `range` are decommitted, the way a partial-range copy
    /// leaves the rest of the destination block without content.
    pub(crate) fn create_shared(
        base: *mut u8,
        mapping: Arc<Mapping>,
        src_pages: &[PageState],
        range: PageRange,
        ro: bool,
    ) -> Result<BlockRec> {
        map_view(base, &mapping, View::Cow)?;
        let pages: Vec<PageState> = (0..pages_per_block())
            .map(|i| {
                if !range.contains(&i) {
                    PageState::Decommitted
                } else if !src_pages[i].is_committed() {
                    src_pages[i]
                } else if ro || !src_pages[i].is_writable() {
                    PageState::RoMappedShared
                } else {
                    PageState::RwMappedShared
                }
            })
            .collect();
        let rec = BlockRec {
            mapping,
            view: View::Cow,
            ro,
            pages,
        };
        rec.apply_protections(base)?;
        Ok(rec)
    }

    /// Re-applies per-page protection from the state table, grouping equal
    /// runs into single `mprotect` calls.
    pub(crate) fn apply_protections(&self, base: *mut u8) -> Result<()> {
        let n = self.pages.len();
        let mut begin = 0;
        while begin < n {
            let prot = prot_for(self.pages[begin]);
            let mut end = begin + 1;
            while end < n && prot_for(self.pages[end]) == prot {
                end += 1;
            }
            // The view was mapped read-write; only narrower runs need a call.
            if prot != (ProtFlags::PROT_READ | ProtFlags::PROT_WRITE) {
                protect_run(base, begin, end - begin, prot)?;
            }
            begin = end;
        }
        Ok(())
    }

    pub(crate) fn state(&self, page: usize) -> PageState {
        self.pages[page]
    }

    /// True if any committed page lies outside `range`.
    pub(crate) fn committed_outside(&self, range: &PageRange) -> bool {
        self.pages
            .iter()
            .enumerate()
            .any(|(i, s)| !range.contains(&i) && s.is_committed())
    }

    pub(crate) fn all_committed(&self, range: &PageRange) -> bool {
        range.clone().all(|i| self.pages[i].is_committed())
    }

    /// Whether hardware CoW has disconnected the page from the mapping.
    pub(crate) fn diverged(&self, base: *mut u8, page: usize) -> Result<bool> {
        if self.view != View::Cow || !self.pages[page].is_committed() {
            return Ok(false);
        }
        Ok(pagemap::probe(base as usize + page * commit_unit())?.diverged())
    }

    /// Commit pages of `range` that are not committed yet. May have to
    /// disconnect the block from sharing first: new pages must not surface
    /// through a mapping some partner still views.
    pub(crate) fn commit(&mut self, base: *mut u8, range: PageRange) -> Result<()> {
        if range.clone().all(|i| self.pages[i].is_committed()) {
            return Ok(());
        }
        if self.view == View::Cow {
            self.remap(base, false)?;
        }
        let committed = if self.ro {
            PageState::RoMappedPrivate
        } else {
            PageState::RwMappedPrivate
        };
        let mut run = None::<PageRange>;
        for i in range {
            if !self.pages[i].is_committed() {
                self.pages[i] = committed;
                run = match run {
                    Some(r) if r.end == i => Some(r.start..i + 1),
                    Some(r) => {
                        protect_run(base, r.start, r.end - r.start, prot_for(committed))?;
                        Some(i..i + 1)
                    }
                    None => Some(i..i + 1),
                };
            }
        }
        if let Some(r) = run {
            protect_run(base, r.start, r.end - r.start, prot_for(committed))?;
        }
        Ok(())
    }

    /// Drops page contents of `range` and makes the pages inaccessible.
    /// The caller handles the whole-block case by unmapping instead.
    pub(crate) fn decommit(&mut self, base: *mut u8, range: PageRange) -> Result<()> {
        if range.is_empty() {
            return Ok(());
        }
        let page = commit_unit();
        match self.view {
            View::Direct => {
                self.mapping
                    .punch_hole(range.start * page, (range.end - range.start) * page)?;
            }
            View::Cow => {
                let addr = base as usize + range.start * page;
                // Drops privatized copies; the backing pages stay with the
                // mapping for any partner views.
                // SAFETY: range lies within the mapped block.
                unsafe {
                    madvise(
                        NonNull::new(addr as *mut _).ok_or(MemError::Internal)?,
                        (range.end - range.start) * page,
                        MmapAdvise::MADV_DONTNEED,
                    )
                }
                .map_err(|e| MemError::from_os("madvise", e.into()))?;
            }
        }
        protect_run(
            base,
            range.start,
            range.end - range.start,
            ProtFlags::PROT_NONE,
        )?;
        for i in range {
            if self.pages[i].is_committed() {
                self.pages[i] = PageState::Decommitted;
            }
        }
        Ok(())
    }

    /// Makes the block shareable over `range`: after this, partners may
    /// view `self.mapping` and observe exactly the content of the range.
    ///
    /// A direct view flips to copy-on-write in place (the backing already
    /// holds every write). A copy-on-write view is reusable as-is unless
    /// pages have privatized or been decommitted, in which case the block
    /// is rebuilt over a fresh mapping (the remap algorithm).
    pub(crate) fn prepare_to_share(&mut self, base: *mut u8, range: PageRange) -> Result<()> {
        if !self.all_committed(&range) {
            return Err(MemError::BadParam);
        }
        match self.view {
            View::Direct => {
                map_view(base, &self.mapping, View::Cow)?;
                self.view = View::Cow;
                for s in self.pages.iter_mut() {
                    *s = s.shared();
                }
                self.apply_protections(base)?;
                Ok(())
            }
            View::Cow => {
                let mut need_remap = self
                    .pages
                    .iter()
                    .any(|s| *s == PageState::Decommitted);
                if !need_remap {
                    for i in range {
                        if self.diverged(base, i)? {
                            need_remap = true;
                            break;
                        }
                    }
                }
                if need_remap {
                    self.remap(base, true)?;
                }
                Ok(())
            }
        }
    }

    /// The remap algorithm: capture the live content of every committed
    /// page into a fresh mapping, swap the view over to it, and restore
    /// narrowed protections. `for_share` selects whether the result is a
    /// share-ready copy-on-write view or a private direct view.
    ///
    /// Content is read through the old view (the only place privatized
    /// pages exist) before the `MAP_FIXED` swap, so a failed swap leaves
    /// the old view intact and the operation can simply be retried.
    pub(crate) fn remap(&mut self, base: *mut u8, for_share: bool) -> Result<()> {
        let fresh = Mapping::new_block()?;
        let page = commit_unit();
        let n = self.pages.len();
        let mut begin = 0;
        while begin < n {
            if self.pages[begin].is_committed() {
                let mut end = begin + 1;
                while end < n && self.pages[end].is_committed() {
                    end += 1;
                }
                let offset = begin * page;
                // SAFETY: committed pages are readable through the live view.
                let content = unsafe {
                    std::slice::from_raw_parts((base as usize + offset) as *const u8, (end - begin) * page)
                };
                fresh.write_at(content, offset)?;
                begin = end;
            } else {
                begin += 1;
            }
        }

        let (view, transition): (View, fn(PageState) -> PageState) = if for_share {
            (View::Cow, PageState::shared)
        } else {
            (View::Direct, PageState::privatized)
        };
        map_view(base, &fresh, view)?;
        self.mapping = Arc::new(fresh);
        self.view = view;
        for s in self.pages.iter_mut() {
            *s = transition(*s);
        }
        self.apply_protections(base)
    }
}
