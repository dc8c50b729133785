// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

//! Process-global address-space map.
//!
//! A two-level table keyed by block number holds one word per block:
//! free, a reserved sentinel, or a pointer to the block's mapping record.
//! Every state transition swaps the slot to a busy sentinel first, so
//! transitions serialize per block without any blocking lock; races
//! between reserve/release and map/unmap retry after a scheduler yield.

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::OnceLock;

use crossbeam_utils::Backoff;
use nix::sys::mman::{MapFlags, ProtFlags};

use crate::block::{self, pages_inward, pages_outward, BlockRec};
use crate::error::{MemError, Result};
use crate::page_state::PageState;
use crate::{commit_unit, pages_per_block, AllocFlags, BLOCK_SIZE};

// Slot sentinels. Odd values can never be a valid `Box<BlockRec>` pointer.
const FREE: usize = 0;
const RESERVED_RW: usize = 1;
const RESERVED_RO: usize = 3;
const BUSY: usize = 5;

// Two-level table: 2^TOP_BITS second-level tables of 2^LEAF_BITS slots,
// covering 2^(TOP_BITS + LEAF_BITS) blocks of the virtual address space.
const LEAF_BITS: usize = 16;
const TOP_BITS: usize = 15;
const LEAF_LEN: usize = 1 << LEAF_BITS;
const TOP_LEN: usize = 1 << TOP_BITS;

pub(crate) struct AddressSpace {
    top: Box<[AtomicPtr<AtomicUsize>]>,
}

// SAFETY: all interior mutability is atomic.
unsafe impl Sync for AddressSpace {}
unsafe impl Send for AddressSpace {}

pub(crate) fn space() -> &'static AddressSpace {
    static SPACE: OnceLock<AddressSpace> = OnceLock::new();
    SPACE.get_or_init(|| {
        tracing::debug!(
            block_size = BLOCK_SIZE,
            commit_unit = commit_unit(),
            "address space initialized"
        );
        let mut top = Vec::with_capacity(TOP_LEN);
        top.resize_with(TOP_LEN, || AtomicPtr::new(std::ptr::null_mut()));
        AddressSpace {
            top: top.into_boxed_slice(),
        }
    })
}

fn block_index(addr: usize) -> usize {
    addr / BLOCK_SIZE
}

fn yield_on_race() {
    std::thread::yield_now();
}

/// Exclusive hand-off on one block slot. While held, the slot reads as
/// busy and every other accessor spins with backoff.
struct SlotGuard<'a> {
    slot: &'a AtomicUsize,
    val: usize,
}

enum SlotValue<'g> {
    Free,
    Reserved { ro: bool },
    Mapped(&'g mut BlockRec),
}

impl<'a> SlotGuard<'a> {
    fn lock(slot: &'a AtomicUsize) -> SlotGuard<'a> {
        let backoff = Backoff::new();
        loop {
            let cur = slot.load(Ordering::Acquire);
            if cur != BUSY
                && slot
                    .compare_exchange(cur, BUSY, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return SlotGuard { slot, val: cur };
            }
            backoff.snooze();
        }
    }

    fn value(&mut self) -> SlotValue<'_> {
        match self.val {
            FREE => SlotValue::Free,
            RESERVED_RW => SlotValue::Reserved { ro: false },
            RESERVED_RO => SlotValue::Reserved { ro: true },
            p => {
                // SAFETY: a non-sentinel value is a Box::into_raw pointer and
                // we hold the busy hand-off, so access is exclusive.
                SlotValue::Mapped(unsafe { &mut *(p as *mut BlockRec) })
            }
        }
    }

    fn set_free(&mut self) {
        self.take_mapped();
        self.val = FREE;
    }

    fn set_reserved(&mut self, ro: bool) {
        self.take_mapped();
        self.val = if ro { RESERVED_RO } else { RESERVED_RW };
    }

    fn set_mapped(&mut self, rec: Box<BlockRec>) {
        self.take_mapped();
        self.val = Box::into_raw(rec) as usize;
    }

    fn take_mapped(&mut self) -> Option<Box<BlockRec>> {
        match self.val {
            FREE | RESERVED_RW | RESERVED_RO => None,
            p => {
                self.val = FREE;
                // SAFETY: exclusive by the busy hand-off; pointer came from
                // Box::into_raw.
                Some(unsafe { Box::from_raw(p as *mut BlockRec) })
            }
        }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        debug_assert_ne!(self.val, BUSY);
        self.slot.store(self.val, Ordering::Release);
    }
}

impl AddressSpace {
    /// Slot for the block containing `addr`; `create` commits the
    /// second-level table on demand.
    fn slot(&self, addr: usize, create: bool) -> Result<Option<&AtomicUsize>> {
        let idx = block_index(addr);
        let i0 = idx >> LEAF_BITS;
        let i1 = idx & (LEAF_LEN - 1);
        if i0 >= TOP_LEN {
            return Err(MemError::BadParam);
        }
        let mut leaf = self.top[i0].load(Ordering::Acquire);
        if leaf.is_null() {
            if !create {
                return Ok(None);
            }
            let mut fresh = Vec::with_capacity(LEAF_LEN);
            fresh.resize_with(LEAF_LEN, || AtomicUsize::new(FREE));
            let fresh = Box::into_raw(fresh.into_boxed_slice()) as *mut AtomicUsize;
            match self.top[i0].compare_exchange(
                std::ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => leaf = fresh,
                Err(cur) => {
                    // SAFETY: `fresh` was just created and lost the race.
                    drop(unsafe {
                        Box::from_raw(std::ptr::slice_from_raw_parts_mut(fresh, LEAF_LEN))
                    });
                    leaf = cur;
                }
            }
        }
        // SAFETY: leaf tables are never freed once published.
        Ok(Some(unsafe { &*leaf.add(i1) }))
    }

    fn allocated_slot(&self, addr: usize) -> Result<&AtomicUsize> {
        match self.slot(addr, false)? {
            Some(s) if s.load(Ordering::Acquire) != FREE => Ok(s),
            _ => Err(MemError::BadParam),
        }
    }

    fn lock_block(&self, addr: usize) -> Result<SlotGuard<'_>> {
        let slot = self.slot(addr, true)?.ok_or(MemError::Internal)?;
        Ok(SlotGuard::lock(slot))
    }

    fn range_managed(&self, ptr: usize, size: usize) -> bool {
        let begin = ptr - ptr % BLOCK_SIZE;
        let mut p = begin;
        while p < ptr + size {
            match self.slot(p, false) {
                Ok(Some(s)) if s.load(Ordering::Acquire) != FREE => {}
                _ => return false,
            }
            p += BLOCK_SIZE;
        }
        true
    }

    // ----- reservation ---------------------------------------------------

    pub(crate) fn reserve(
        &self,
        dst: usize,
        size: usize,
        flags: AllocFlags,
    ) -> Result<*mut u8> {
        if size == 0 {
            return Err(MemError::BadParam);
        }
        let exactly = flags.contains(AllocFlags::EXACTLY);
        let ro = flags.contains(AllocFlags::READ_ONLY);
        let (hint, len) = if dst != 0 {
            let begin = dst - dst % BLOCK_SIZE;
            let end = round_up(dst + size, BLOCK_SIZE);
            (begin, end - begin)
        } else {
            (0, round_up(size, BLOCK_SIZE))
        };

        loop {
            let mut map_flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE;
            #[cfg(target_os = "linux")]
            if exactly && hint != 0 {
                map_flags |= MapFlags::MAP_FIXED_NOREPLACE;
            }
            // SAFETY: anonymous reservation; never MAP_FIXED, so nothing is
            // clobbered.
            let got = unsafe {
                nix::sys::mman::mmap_anonymous(
                    NonZeroUsize::new(hint),
                    NonZeroUsize::new(len).ok_or(MemError::BadParam)?,
                    ProtFlags::PROT_NONE,
                    map_flags,
                )
            }
            .map_err(|e| {
                if exactly && hint != 0 {
                    MemError::NoMemory
                } else {
                    MemError::from_os("mmap reserve", e.into())
                }
            })?;
            let base = got.as_ptr() as usize;
            if exactly && hint != 0 && base != hint {
                // SAFETY: unmapping what we just mapped.
                unsafe { nix::sys::mman::munmap(got, len) }
                    .map_err(|e| MemError::from_os("munmap", e.into()))?;
                return Err(MemError::NoMemory);
            }

            // Claim the block slots; back out and retry on a conflict with
            // a release still clearing its slots.
            let mut claimed = 0;
            let mut conflict = false;
            while claimed < len {
                let slot = self.slot(base + claimed, true)?.ok_or(MemError::Internal)?;
                if slot
                    .compare_exchange(
                        FREE,
                        if ro { RESERVED_RO } else { RESERVED_RW },
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_err()
                {
                    conflict = true;
                    break;
                }
                claimed += BLOCK_SIZE;
            }
            if !conflict {
                return Ok(if dst != 0 && exactly {
                    dst as *mut u8
                } else {
                    base as *mut u8
                });
            }
            let mut p = base;
            while p < base + claimed {
                self.slot(p, false)?
                    .ok_or(MemError::Internal)?
                    .store(FREE, Ordering::Release);
                p += BLOCK_SIZE;
            }
            // SAFETY: unmapping our own fresh reservation.
            unsafe { nix::sys::mman::munmap(got, len) }
                .map_err(|e| MemError::from_os("munmap", e.into()))?;
            if exactly && hint != 0 {
                return Err(MemError::NoMemory);
            }
            yield_on_race();
        }
    }

    pub(crate) fn release(&self, ptr: usize, size: usize) -> Result<()> {
        if ptr == 0 || size == 0 {
            return Ok(());
        }
        let begin = ptr - ptr % BLOCK_SIZE;
        let end = round_up(ptr + size, BLOCK_SIZE);

        // The whole range must be allocated before anything is torn down.
        let mut p = begin;
        while p < end {
            self.allocated_slot(p)?;
            p += BLOCK_SIZE;
        }

        let mut p = begin;
        while p < end {
            self.release_block(p)?;
            p += BLOCK_SIZE;
        }
        Ok(())
    }

    fn release_block(&self, base: usize) -> Result<()> {
        let mut guard = self.lock_block(base)?;
        let rec = guard.take_mapped();
        // Unmap the view first, then close the mapping handle (the record
        // drop releases the last handle reference).
        // SAFETY: unmapping one owned block.
        unsafe {
            nix::sys::mman::munmap(
                NonNull::new(base as *mut _).ok_or(MemError::Internal)?,
                BLOCK_SIZE,
            )
        }
        .map_err(|e| MemError::from_os("munmap", e.into()))?;
        drop(rec);
        guard.set_free();
        Ok(())
    }

    // ----- commit / decommit --------------------------------------------

    pub(crate) fn commit(&self, ptr: usize, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        if ptr == 0 {
            return Err(MemError::BadParam);
        }
        let mut p = ptr - ptr % BLOCK_SIZE;
        while p < ptr + size {
            self.allocated_slot(p)?;
            p += BLOCK_SIZE;
        }

        let mut p = ptr;
        let end = ptr + size;
        while p < end {
            let base = p - p % BLOCK_SIZE;
            let block_end = (base + BLOCK_SIZE).min(end);
            match self.commit_block(base, p - base, block_end - p) {
                Ok(()) => p = block_end,
                Err(e) => {
                    // Roll back what this call committed.
                    let _ = self.decommit(ptr, p - ptr);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn commit_block(&self, base: usize, off: usize, len: usize) -> Result<()> {
        let range = pages_outward(off, len);
        let mut guard = self.lock_block(base)?;
        match guard.value() {
            SlotValue::Free => Err(MemError::BadParam),
            SlotValue::Reserved { ro } => {
                let rec = BlockRec::create_committed(base as *mut u8, range, ro)?;
                guard.set_mapped(Box::new(rec));
                Ok(())
            }
            SlotValue::Mapped(rec) => rec.commit(base as *mut u8, range),
        }
    }

    pub(crate) fn decommit(&self, ptr: usize, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        if ptr == 0 {
            return Err(MemError::BadParam);
        }
        let mut p = ptr - ptr % BLOCK_SIZE;
        while p < ptr + size {
            self.allocated_slot(p)?;
            p += BLOCK_SIZE;
        }

        let mut p = ptr;
        let end = ptr + size;
        while p < end {
            let base = p - p % BLOCK_SIZE;
            let block_end = (base + BLOCK_SIZE).min(end);
            self.decommit_block(base, p - base, block_end - p)?;
            p = block_end;
        }
        Ok(())
    }

    fn decommit_block(&self, base: usize, off: usize, len: usize) -> Result<()> {
        let range = pages_inward(off, len);
        let mut guard = self.lock_block(base)?;
        let ro = match guard.value() {
            SlotValue::Mapped(rec) => {
                if range.start > 0 || range.end < pages_per_block() {
                    // Partial: the whole block can still be unmapped when
                    // nothing committed survives outside the range.
                    if rec.committed_outside(&range) {
                        return rec.decommit(base as *mut u8, range);
                    }
                }
                rec.ro
            }
            // Decommit of reserved or already-unmapped memory is a no-op.
            _ => return Ok(()),
        };
        drop(guard.take_mapped());
        block::reserve_fixed(base as *mut u8)?;
        guard.set_reserved(ro);
        Ok(())
    }

    // ----- observability -------------------------------------------------

    fn page_access(&self, ptr: usize, size: usize, write: bool) -> bool {
        if ptr == 0 || size == 0 {
            return false;
        }
        let mut p = ptr;
        let end = ptr + size;
        while p < end {
            let base = p - p % BLOCK_SIZE;
            let ok = match self.slot(base, false) {
                Ok(Some(slot)) => {
                    let mut guard = SlotGuard::lock(slot);
                    match guard.value() {
                        SlotValue::Mapped(rec) => {
                            let s = rec.state((p - base) / commit_unit());
                            if write {
                                s.is_writable()
                            } else {
                                s.is_committed()
                            }
                        }
                        _ => false,
                    }
                }
                _ => false,
            };
            if !ok {
                return false;
            }
            p = round_up(p + 1, commit_unit());
        }
        true
    }

    pub(crate) fn is_readable(&self, ptr: usize, size: usize) -> bool {
        self.page_access(ptr, size, false)
    }

    pub(crate) fn is_writable(&self, ptr: usize, size: usize) -> bool {
        self.page_access(ptr, size, true)
    }

    pub(crate) fn is_private(&self, ptr: usize, size: usize) -> Result<bool> {
        if ptr == 0 || size == 0 {
            return Err(MemError::BadParam);
        }
        let mut p = ptr;
        let end = ptr + size;
        while p < end {
            let base = p - p % BLOCK_SIZE;
            if let Some(slot) = self.slot(base, false)? {
                let mut guard = SlotGuard::lock(slot);
                if let SlotValue::Mapped(rec) = guard.value() {
                    let page = (p - base) / commit_unit();
                    if rec.state(page).may_be_shared()
                        && rec.state(page).is_committed()
                        && !rec.diverged(base as *mut u8, page)?
                    {
                        return Ok(false);
                    }
                }
            }
            p = round_up(p + 1, commit_unit());
        }
        Ok(true)
    }

    pub(crate) fn is_copy(&self, p1: usize, p2: usize, size: usize) -> Result<bool> {
        if p1 == 0 || p2 == 0 || size == 0 {
            return Err(MemError::BadParam);
        }
        if p1 == p2 {
            return Ok(true);
        }
        if (p1 % BLOCK_SIZE) != (p2 % BLOCK_SIZE) {
            return Ok(false);
        }
        let mut off = 0;
        while off < size {
            let a = p1 + off;
            let b = p2 + off;
            let (ia, ib) = (self.page_ident(a)?, self.page_ident(b)?);
            match (ia, ib) {
                (Some((ma, da)), Some((mb, db))) => {
                    if ma != mb || da || db {
                        return Ok(false);
                    }
                }
                _ => return Ok(false),
            }
            off = round_up(off + 1, commit_unit());
        }
        Ok(true)
    }

    /// (mapping id, diverged) of a shared committed page, if the page is in
    /// a state that can participate in a copy at all.
    fn page_ident(&self, p: usize) -> Result<Option<(u64, bool)>> {
        let base = p - p % BLOCK_SIZE;
        let Some(slot) = self.slot(base, false)? else {
            return Ok(None);
        };
        let mut guard = SlotGuard::lock(slot);
        if let SlotValue::Mapped(rec) = guard.value() {
            let page = (p - base) / commit_unit();
            let s = rec.state(page);
            if s.is_committed() && s.may_be_shared() {
                let diverged = rec.diverged(base as *mut u8, page)?;
                return Ok(Some((rec.mapping.id(), diverged)));
            }
        }
        Ok(None)
    }

    pub(crate) fn change_protection(&self, ptr: usize, size: usize, ro: bool) -> Result<()> {
        let mut p = ptr;
        let end = ptr + size;
        while p < end {
            let base = p - p % BLOCK_SIZE;
            let block_end = (base + BLOCK_SIZE).min(end);
            let mut guard = self.lock_block(base)?;
            if let SlotValue::Mapped(rec) = guard.value() {
                for i in pages_outward(p - base, block_end - p) {
                    rec.pages[i] = match (rec.pages[i], ro) {
                        (PageState::RwMappedPrivate, true) => PageState::RoMappedPrivate,
                        (PageState::RwMappedShared, true) => PageState::RoMappedShared,
                        (PageState::RoMappedPrivate, false) => PageState::RwMappedPrivate,
                        (PageState::RoMappedShared, false) => PageState::RwMappedShared,
                        (s, _) => s,
                    };
                }
                rec.apply_protections(base as *mut u8)?;
            } else {
                return Err(MemError::BadParam);
            }
            p = block_end;
        }
        Ok(())
    }

    // ----- copy / move ---------------------------------------------------

    pub(crate) fn copy(
        &self,
        dst: usize,
        src: usize,
        size: usize,
        flags: AllocFlags,
    ) -> Result<*mut u8> {
        if src == 0 || size == 0 {
            return Err(MemError::BadParam);
        }
        let src_managed = self.range_managed(src, size);

        // Releasing a block into an allocator-chosen destination: the
        // source itself is that destination.
        if flags.contains(AllocFlags::RELEASE) && src_managed && (dst == 0 || dst == src) {
            if flags.contains(AllocFlags::READ_ONLY) {
                self.change_protection(src, size, true)?;
            }
            return Ok(src as *mut u8);
        }

        // A self-copy has nothing to transfer.
        if dst == src && src_managed {
            if flags.contains(AllocFlags::READ_ONLY) {
                self.change_protection(src, size, true)?;
            }
            return Ok(src as *mut u8);
        }

        if !src_managed {
            return self.byte_copy(dst, src, size, flags);
        }
        if dst != 0 && !self.range_managed(dst, size) && !flags.contains(AllocFlags::ALLOCATE) {
            // Foreign destination: plain byte copy, the caller owns it.
            if !self.is_readable(src, size) {
                return Err(MemError::BadParam);
            }
            // SAFETY: source readable; destination is caller-provided.
            unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, size) };
            return Ok(dst as *mut u8);
        }

        // Choose a destination with matching in-block offsets so the
        // ranges can share mappings.
        let dst = if dst == 0 {
            let head = src % BLOCK_SIZE;
            let len = round_up(head + size, BLOCK_SIZE);
            let base = self.reserve(0, len, AllocFlags::empty())? as usize;
            base + head
        } else {
            if (dst % BLOCK_SIZE) != (src % BLOCK_SIZE) {
                return self.byte_copy(dst, src, size, flags);
            }
            // Claim destination blocks that are still free (only legal
            // when the allocator is allowed to allocate).
            let mut p = dst - dst % BLOCK_SIZE;
            while p < dst + size {
                match self.slot(p, true)? {
                    Some(s) if s.load(Ordering::Acquire) != FREE => {}
                    _ if flags.contains(AllocFlags::ALLOCATE) => {
                        self.reserve(p, BLOCK_SIZE, AllocFlags::EXACTLY)?;
                    }
                    _ => return Err(MemError::BadParam),
                }
                p += BLOCK_SIZE;
            }
            dst
        };

        self.share_or_move(dst, src, size, flags)?;

        if flags.contains(AllocFlags::RELEASE) {
            self.release_outside(src, size, dst)?;
        }
        Ok(dst as *mut u8)
    }

    /// Per-block sharing/moving over offset-compatible ranges. Overlapping
    /// moves walk in an order that never clobbers unprocessed source.
    fn share_or_move(&self, dst: usize, src: usize, size: usize, flags: AllocFlags) -> Result<()> {
        let release_like = flags.intersects(AllocFlags::RELEASE | AllocFlags::DECOMMIT);
        let ro = flags.contains(AllocFlags::READ_ONLY);
        let src_begin = src - src % BLOCK_SIZE;
        let block_count = (round_up(src + size, BLOCK_SIZE) - src_begin) / BLOCK_SIZE;
        let forward = dst < src;

        for i in 0..block_count {
            let i = if forward { i } else { block_count - 1 - i };
            let sb = src_begin + i * BLOCK_SIZE;
            let seg_begin = sb.max(src);
            let seg_end = (sb + BLOCK_SIZE).min(src + size);
            let off = seg_begin - sb;
            let len = seg_end - seg_begin;
            let db = (dst - dst % BLOCK_SIZE) + i * BLOCK_SIZE;
            let range = pages_outward(off, len);

            if release_like {
                // Try to move the whole mapping record across. A reserved
                // source block carries no content at all.
                enum Carry {
                    Moved(Box<BlockRec>),
                    Reservation,
                    Share,
                }
                let carry = {
                    let mut guard = self.lock_block(sb)?;
                    match guard.value() {
                        SlotValue::Mapped(rec) if !rec.committed_outside(&range) => {
                            let rec = guard.take_mapped().ok_or(MemError::Internal)?;
                            block::reserve_fixed(sb as *mut u8)?;
                            guard.set_reserved(rec.ro);
                            Carry::Moved(rec)
                        }
                        SlotValue::Mapped(_) => Carry::Share,
                        SlotValue::Reserved { .. } => Carry::Reservation,
                        SlotValue::Free => return Err(MemError::BadParam),
                    }
                };
                match carry {
                    Carry::Moved(mut rec) => {
                        if ro {
                            for s in rec.pages.iter_mut() {
                                *s = match *s {
                                    PageState::RwMappedPrivate => PageState::RoMappedPrivate,
                                    PageState::RwMappedShared => PageState::RoMappedShared,
                                    other => other,
                                };
                            }
                        }
                        let mut dguard = self.lock_block(db)?;
                        drop(dguard.take_mapped());
                        block::map_view(db as *mut u8, &rec.mapping, rec.view)?;
                        rec.apply_protections(db as *mut u8)?;
                        dguard.set_mapped(rec);
                        continue;
                    }
                    // The destination block was claimed reserved already.
                    Carry::Reservation => continue,
                    // Unrelated data shares the source block: share, then
                    // drop only the copied range.
                    Carry::Share => {}
                }
            }

            self.share_block(sb, db, range.clone(), ro)?;
            if flags.contains(AllocFlags::DECOMMIT) {
                self.decommit(seg_begin, len)?;
            }
        }
        Ok(())
    }

    fn share_block(
        &self,
        sb: usize,
        db: usize,
        range: block::PageRange,
        ro: bool,
    ) -> Result<()> {
        // Prepare the source and capture what the destination needs.
        let (mapping, states) = {
            let mut guard = self.lock_block(sb)?;
            match guard.value() {
                SlotValue::Mapped(rec) => {
                    rec.prepare_to_share(sb as *mut u8, range.clone())?;
                    (rec.mapping.clone(), rec.pages.clone())
                }
                _ => return Err(MemError::BadParam),
            }
        };

        let mut dguard = self.lock_block(db)?;
        match dguard.value() {
            SlotValue::Mapped(dst_rec) => {
                if std::sync::Arc::ptr_eq(&dst_rec.mapping, &mapping) {
                    // Already a copy; leave it alone unless a side has
                    // privatized pages, which a fresh view resets.
                    let mut stale = false;
                    for i in range.clone() {
                        if dst_rec.diverged(db as *mut u8, i)? {
                            stale = true;
                            break;
                        }
                    }
                    if !stale {
                        return Ok(());
                    }
                } else if dst_rec.committed_outside(&range) {
                    // The destination holds unrelated data; byte copy into
                    // the committed range instead of remapping it away.
                    drop(dguard);
                    let page = commit_unit();
                    let off = range.start * page;
                    let len = (range.end - range.start) * page;
                    self.commit(db + off, len)?;
                    // SAFETY: source committed (prepared above), destination
                    // just committed.
                    unsafe {
                        std::ptr::copy((sb + off) as *const u8, (db + off) as *mut u8, len)
                    };
                    if ro {
                        self.change_protection(db + off, len, true)?;
                    }
                    return Ok(());
                }
                let rec = BlockRec::create_shared(db as *mut u8, mapping, &states, range, ro)?;
                dguard.set_mapped(Box::new(rec));
                Ok(())
            }
            SlotValue::Reserved { .. } => {
                let rec = BlockRec::create_shared(db as *mut u8, mapping, &states, range, ro)?;
                dguard.set_mapped(Box::new(rec));
                Ok(())
            }
            SlotValue::Free => Err(MemError::BadParam),
        }
    }

    fn byte_copy(&self, dst: usize, src: usize, size: usize, flags: AllocFlags) -> Result<*mut u8> {
        let dst = if dst == 0 {
            self.reserve(0, size, AllocFlags::empty())? as usize
        } else {
            dst
        };
        if self.range_managed(dst, size) {
            self.commit(dst, size)?;
        }
        // SAFETY: destination is writable (just committed or foreign,
        // caller-owned); the ranges may overlap, `copy` handles that.
        unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, size) };
        if flags.contains(AllocFlags::READ_ONLY) && self.range_managed(dst, size) {
            self.change_protection(dst, size, true)?;
        }
        if self.range_managed(src, size) {
            if flags.contains(AllocFlags::RELEASE) {
                self.release(src, size)?;
            } else if flags.contains(AllocFlags::DECOMMIT) {
                self.decommit(src, size)?;
            }
        }
        Ok(dst as *mut u8)
    }

    /// After a move, frees every source block that did not become part of
    /// the destination range.
    fn release_outside(&self, src: usize, size: usize, dst: usize) -> Result<()> {
        let dst_begin = dst - dst % BLOCK_SIZE;
        let dst_end = round_up(dst + size, BLOCK_SIZE);
        let mut p = src - src % BLOCK_SIZE;
        let end = round_up(src + size, BLOCK_SIZE);
        while p < end {
            if p < dst_begin || p >= dst_end {
                self.release_block(p)?;
            }
            p += BLOCK_SIZE;
        }
        Ok(())
    }
}

pub(crate) fn round_up(v: usize, unit: usize) -> usize {
    (v + unit - 1) / unit * unit
}
