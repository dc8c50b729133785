// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

//! Buddy-bitmap heap directory.
//!
//! Block sizes are quantized to powers of two and placed at offsets
//! divisible by their size, so a page-multiple block lands page-aligned
//! and a cache-line-multiple block lands line-aligned, on any hardware.
//!
//! Free blocks live in a bitmap pyramid: one bit per block per level, bit
//! set = free. The largest block is smaller than the heap, so the pyramid
//! is truncated at the top; the space above it holds the free-block-count
//! index, an array of 16-bit counters (lower levels first). A level with
//! more than 64 Ki blocks is split across several counters so a counter
//! never covers more than 64 Ki bits of bitmap; when the header is too
//! small for a counter per level, the top levels merge into one counter.
//!
//! Counters are decremented before a bit is cleared and incremented after
//! a bit is set, so a counter never exceeds the population of its bitmap
//! slice at rest, and a successful decrement entitles the caller to one
//! bit. All bitmap traffic is lock-free: decrement-if-nonzero,
//! CAS-clear-rightmost, CAS-clear-mask, fetch-or.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

use crossbeam_utils::Backoff;
use nirvana_port::{MemError, Memory, Result};

pub const HEAP_LEVELS: usize = 11;
pub const MAX_BLOCK_UNITS: usize = 1 << (HEAP_LEVELS - 1);

const WORD_BITS: usize = usize::BITS as usize;
const WORD_BYTES: usize = std::mem::size_of::<usize>();

/// A counter covers at most this many bits of bitmap.
const COUNTER_SPAN_BITS: usize = 1 << 16;

/// Bounded rescans before a counter/bitmap disagreement is reported.
const MAX_SCAN_PASSES: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct BitmapIndex {
    level: usize,
    /// Word offset of the covered bitmap area, in top-bitmap-words units.
    offset_tbw: usize,
}

/// The three supported directory sizes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DirectorySize {
    /// 16 KiB: one counter each for the three lowest levels, the top
    /// eight levels merged.
    Small,
    /// 32 KiB: the bottom level split in two, the top five levels merged.
    Medium,
    /// 64 KiB: a counter per level, the two bottom levels split.
    Large,
}

const BI_LARGE: &[BitmapIndex] = &[
    BitmapIndex { level: 0, offset_tbw: 0 },
    BitmapIndex { level: 1, offset_tbw: 1 },
    BitmapIndex { level: 2, offset_tbw: 3 },
    BitmapIndex { level: 3, offset_tbw: 7 },
    BitmapIndex { level: 4, offset_tbw: 15 },
    BitmapIndex { level: 5, offset_tbw: 31 },
    BitmapIndex { level: 6, offset_tbw: 63 },
    BitmapIndex { level: 7, offset_tbw: 127 },
    BitmapIndex { level: 8, offset_tbw: 255 },
    BitmapIndex { level: 9, offset_tbw: 511 + 256 },
    BitmapIndex { level: 9, offset_tbw: 511 },
    BitmapIndex { level: 10, offset_tbw: 1023 + 512 + 256 },
    BitmapIndex { level: 10, offset_tbw: 1023 + 512 },
    BitmapIndex { level: 10, offset_tbw: 1023 + 256 },
    BitmapIndex { level: 10, offset_tbw: 1023 },
];

const BI_MEDIUM: &[BitmapIndex] = &[
    BitmapIndex { level: 4, offset_tbw: 15 },
    BitmapIndex { level: 5, offset_tbw: 31 },
    BitmapIndex { level: 6, offset_tbw: 63 },
    BitmapIndex { level: 7, offset_tbw: 127 },
    BitmapIndex { level: 8, offset_tbw: 255 },
    BitmapIndex { level: 9, offset_tbw: 511 },
    BitmapIndex { level: 10, offset_tbw: 1023 + 512 },
    BitmapIndex { level: 10, offset_tbw: 1023 },
];

const BI_SMALL: &[BitmapIndex] = &[
    BitmapIndex { level: 7, offset_tbw: 127 },
    BitmapIndex { level: 8, offset_tbw: 255 },
    BitmapIndex { level: 9, offset_tbw: 511 },
    BitmapIndex { level: 10, offset_tbw: 1023 },
];

// First index slot to search, by size exponent (0 => one unit).
const BIO_LARGE: [usize; HEAP_LEVELS] = [0, 4, 6, 7, 8, 9, 10, 11, 12, 13, 14];
const BIO_MEDIUM: [usize; HEAP_LEVELS] = [0, 2, 3, 4, 5, 6, 7, 7, 7, 7, 7];
const BIO_SMALL: [usize; HEAP_LEVELS] = [0, 1, 2, 3, 3, 3, 3, 3, 3, 3, 3];

impl DirectorySize {
    pub const fn bytes(self) -> usize {
        match self {
            DirectorySize::Small => 0x4000,
            DirectorySize::Medium => 0x8000,
            DirectorySize::Large => 0x10000,
        }
    }

    /// Units managed by one directory: two bits of header per unit.
    pub const fn unit_count(self) -> usize {
        self.bytes() * 4
    }

    fn top_level_blocks(self) -> usize {
        self.unit_count() >> (HEAP_LEVELS - 1)
    }

    fn top_bitmap_words(self) -> usize {
        self.top_level_blocks() / WORD_BITS
    }

    fn bitmap_words(self) -> usize {
        ((1 << HEAP_LEVELS) - 1) * self.top_bitmap_words()
    }

    fn bitmap_byte_offset(self) -> usize {
        self.bytes() - self.bitmap_words() * WORD_BYTES
    }

    fn merged_top(self) -> bool {
        !matches!(self, DirectorySize::Large)
    }

    fn index_len(self) -> usize {
        self.bitmap_index().len()
    }

    fn bitmap_index(self) -> &'static [BitmapIndex] {
        match self {
            DirectorySize::Small => BI_SMALL,
            DirectorySize::Medium => BI_MEDIUM,
            DirectorySize::Large => BI_LARGE,
        }
    }

    fn block_index_offset(self, size_exp: usize) -> usize {
        match self {
            DirectorySize::Small => BIO_SMALL[size_exp],
            DirectorySize::Medium => BIO_MEDIUM[size_exp],
            DirectorySize::Large => BIO_LARGE[size_exp],
        }
    }
}

// Atomic primitives over the shared header.

/// Decrements a free-block counter unless it is zero.
fn acquire(cnt: &AtomicU16) -> bool {
    let mut cur = cnt.load(Ordering::Acquire);
    while cur != 0 {
        match cnt.compare_exchange_weak(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return true,
            Err(c) => cur = c,
        }
    }
    false
}

fn release_cnt(cnt: &AtomicU16) {
    cnt.fetch_add(1, Ordering::AcqRel);
}

/// Clears the rightmost set bit and returns its index.
fn clear_rightmost_one(word: &AtomicUsize) -> Option<u32> {
    let mut bits = word.load(Ordering::Acquire);
    while bits != 0 {
        match word.compare_exchange_weak(
            bits,
            bits & (bits - 1),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return Some(bits.trailing_zeros()),
            Err(b) => bits = b,
        }
    }
    None
}

fn bit_clear(word: &AtomicUsize, mask: usize) -> bool {
    let mut bits = word.load(Ordering::Acquire);
    while bits & mask != 0 {
        match word.compare_exchange_weak(bits, bits & !mask, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return true,
            Err(b) => bits = b,
        }
    }
    false
}

fn bit_set(word: &AtomicUsize, mask: usize) {
    word.fetch_or(mask, Ordering::AcqRel);
}

/// Payload geometry for decommitting freed blocks back to the port.
#[derive(Clone, Copy)]
pub struct Payload {
    pub base: *mut u8,
    pub unit_size: usize,
}

/// One directory laid over a directory-sized region of memory.
///
/// The region may be lazily committed (`backed`): bitmap pages outside the
/// committed prefix are committed on demand during release and probed with
/// `is_readable` during search.
#[derive(Clone, Copy)]
pub struct HeapDirectory {
    base: NonNull<u8>,
    size: DirectorySize,
    backed: bool,
}

// SAFETY: all header access is through atomics.
unsafe impl Send for HeapDirectory {}
unsafe impl Sync for HeapDirectory {}

impl HeapDirectory {
    /// # Safety
    ///
    /// `base` must point to a region of `size.bytes()` bytes that stays
    /// valid for the directory's lifetime; zero-filled where committed.
    /// `backed` means the region came from the port reserved and supports
    /// commit/probe.
    pub unsafe fn new(base: *mut u8, size: DirectorySize, backed: bool) -> Result<HeapDirectory> {
        Ok(HeapDirectory {
            base: NonNull::new(base).ok_or(MemError::BadParam)?,
            size,
            backed,
        })
    }

    /// Commits the header prefix (counters plus the top bitmap words) and
    /// marks the whole heap free: top counter at the top-level block
    /// count, top bitmap words all ones.
    pub fn initialize(&self) -> Result<()> {
        let tbw = self.size.top_bitmap_words();
        if self.backed {
            let prefix = self.size.bitmap_byte_offset() + tbw * WORD_BYTES;
            Memory::commit(self.base.as_ptr(), prefix)?;
        }
        self.counter_at(self.size.index_len() - 1)
            .store(self.size.top_level_blocks() as u16, Ordering::Release);
        for w in 0..tbw {
            self.word(w).store(!0, Ordering::Release);
        }
        Ok(())
    }

    fn counter_at(&self, idx: usize) -> &AtomicU16 {
        debug_assert!(idx < self.size.index_len());
        // SAFETY: the index array is at the start of the region and the
        // region outlives self; 2-byte alignment holds for any region the
        // port or a word-aligned buffer provides.
        unsafe { &*(self.base.as_ptr().add(idx * 2) as *const AtomicU16) }
    }

    fn counter(&self, level: usize, block_number: usize) -> &AtomicU16 {
        let idx = self.size.block_index_offset(HEAP_LEVELS - 1 - level)
            + (block_number >> COUNTER_SPAN_BITS.trailing_zeros());
        self.counter_at(idx)
    }

    fn word(&self, w: usize) -> &AtomicUsize {
        debug_assert!(w < self.size.bitmap_words());
        // SAFETY: bitmap words live at a word-aligned offset within the
        // region.
        unsafe {
            &*(self
                .base
                .as_ptr()
                .add(self.size.bitmap_byte_offset() + w * WORD_BYTES) as *const AtomicUsize)
        }
    }

    fn word_addr(&self, w: usize) -> *mut u8 {
        // Raw address for commit/probe of lazily committed bitmap pages.
        unsafe { self.base.as_ptr().add(self.size.bitmap_byte_offset() + w * WORD_BYTES) }
    }

    fn word_readable(&self, w: usize) -> bool {
        !self.backed || Memory::is_readable(self.word_addr(w), WORD_BYTES)
    }

    fn commit_word(&self, w: usize) -> Result<()> {
        if self.backed {
            Memory::commit(self.word_addr(w), WORD_BYTES)?;
        }
        Ok(())
    }

    fn bitmap_offset(level: usize, tbw: usize) -> usize {
        (tbw << level) - tbw
    }

    /// Units per block at `level`.
    fn block_units(level: usize) -> usize {
        MAX_BLOCK_UNITS >> level
    }

    /// Largest block size (as a level) that both `offset` is aligned to
    /// and fits in `size`.
    fn level_align(offset: usize, size: usize) -> usize {
        debug_assert!(size > 0);
        let align = (offset | MAX_BLOCK_UNITS).trailing_zeros() as usize;
        let fit = (usize::BITS - 1 - size.leading_zeros()) as usize;
        HEAP_LEVELS - 1 - align.min(fit)
    }

    pub fn empty(&self) -> bool {
        let tbw = self.size.top_bitmap_words();
        if self.size.merged_top() {
            (0..tbw).all(|w| self.word(w).load(Ordering::Acquire) == !0)
        } else {
            self.counter_at(self.size.index_len() - 1)
                .load(Ordering::Acquire) as usize
                == self.size.top_level_blocks()
        }
    }

    /// Allocates `units` contiguous units. Returns the unit offset.
    pub fn allocate(&self, units: usize) -> Result<usize> {
        if units == 0 || units > MAX_BLOCK_UNITS {
            return Err(MemError::BadParam);
        }
        // Quantize the block size.
        let size_exp = (usize::BITS - (units - 1).leading_zeros()) as usize;
        let level = HEAP_LEVELS - 1 - size_exp;
        let first_slot = self.size.block_index_offset(size_exp);

        // Search the free-block index, smallest fitting block first.
        let index_len = self.size.index_len();
        let mut slot = first_slot;
        while slot < index_len && !acquire(self.counter_at(slot)) {
            slot += 1;
        }
        if slot >= index_len {
            return Err(MemError::NoMemory);
        }

        let tbw = self.size.top_bitmap_words();
        let bi = self.size.bitmap_index()[index_len - 1 - slot];

        let (found_level, word_idx, bit) = if self.size.merged_top() && slot == index_len - 1 {
            // Merged top levels: walk from the requested level upward.
            let mut lvl = bi.level;
            let mut begin = bi.offset_tbw * tbw;
            if lvl > level {
                lvl = level;
                begin = Self::bitmap_offset(lvl, tbw);
            }
            let mut end = (begin << 1) + tbw;
            let found;
            'search: loop {
                let mut w = begin;
                while w < end {
                    if !self.word_readable(w) {
                        let page = nirvana_port::commit_unit();
                        let next = (self.word_addr(w) as usize / page + 1) * page;
                        w += (next - self.word_addr(w) as usize).div_ceil(WORD_BYTES);
                        continue;
                    }
                    if let Some(bit) = clear_rightmost_one(self.word(w)) {
                        found = (lvl, w, bit);
                        break 'search;
                    }
                    w += 1;
                }
                if lvl == 0 {
                    release_cnt(self.counter_at(slot));
                    return Err(MemError::NoMemory);
                }
                lvl -= 1;
                end = begin;
                begin = (begin - tbw) >> 1;
            }
            found
        } else {
            // The counter guarantees a set bit inside this slot's area.
            let begin = bi.offset_tbw * tbw;
            let span = ((self.size.top_level_blocks() << bi.level).min(COUNTER_SPAN_BITS))
                / WORD_BITS;
            let mut passes = 0;
            let backoff = Backoff::new();
            let found;
            'scan: loop {
                let mut w = begin;
                while w < begin + span {
                    if !self.word_readable(w) {
                        // Uncommitted bitmap page: no bits there, skip to
                        // the next page boundary.
                        let page = nirvana_port::commit_unit();
                        let next = (self.word_addr(w) as usize / page + 1) * page;
                        w = begin
                            + (next - self.word_addr(begin) as usize).div_ceil(WORD_BYTES)
                                .min(span);
                        continue;
                    }
                    if let Some(bit) = clear_rightmost_one(self.word(w)) {
                        found = (bi.level, w, bit);
                        break 'scan;
                    }
                    w += 1;
                }
                passes += 1;
                if passes >= MAX_SCAN_PASSES {
                    // Counter said a block exists, the bitmap disagrees.
                    release_cnt(self.counter_at(slot));
                    return Err(MemError::Internal);
                }
                backoff.snooze();
            }
            found
        };

        let level_begin = Self::bitmap_offset(found_level, tbw);
        debug_assert!(word_idx >= level_begin);
        let block_number = (word_idx - level_begin) * WORD_BITS + bit as usize;
        let allocated = Self::block_units(found_level);
        let offset = block_number * allocated;

        // The block is `allocated` units; give back the tail.
        if units < allocated {
            if let Err(e) = self.release_range(offset + units, offset + allocated, false, None) {
                // Never corrupt the bitmap on failure: hand back what we
                // kept as well, restoring the pre-call state.
                let _ = self.release_range(offset, offset + units, false, None);
                return Err(e);
            }
        }
        Ok(offset)
    }

    /// Claims an explicit unit range. Returns false when any part of the
    /// range is already allocated (the claim is rolled back).
    pub fn allocate_range(&self, begin: usize, end: usize) -> Result<bool> {
        if begin >= end || end > self.size.unit_count() {
            return Err(MemError::BadParam);
        }
        let tbw = self.size.top_bitmap_words();
        let mut claimed_begin = begin;
        let mut claimed_end = begin;
        while claimed_end < end {
            let mut level = Self::level_align(claimed_end, end - claimed_end);
            let mut bl = claimed_end >> (HEAP_LEVELS - 1 - level);
            let block;
            loop {
                let w = Self::bitmap_offset(level, tbw) + bl / WORD_BITS;
                let mask = 1usize << (bl % WORD_BITS);
                let cnt = self.counter(level, bl);
                if acquire(cnt) {
                    if self.word_readable(w) && bit_clear(self.word(w), mask) {
                        block = Some((level, bl));
                        break;
                    }
                    release_cnt(cnt);
                }
                if level == 0 {
                    block = None;
                    break;
                }
                level -= 1;
                bl >>= 1;
            }
            let Some((level, bl)) = block else {
                // The range is not free; put back what we claimed.
                if claimed_begin < claimed_end {
                    self.release_range(claimed_begin, claimed_end, false, None)?;
                }
                return Ok(false);
            };
            let block_offset = bl << (HEAP_LEVELS - 1 - level);
            if block_offset < claimed_begin {
                claimed_begin = block_offset;
            }
            claimed_end = block_offset + Self::block_units(level);
        }

        // Give back the excess at both ends, inside out, so a failure
        // mid-way restores a consistent state.
        let result = self
            .release_range(claimed_begin, begin, true, None)
            .and_then(|()| self.release_range(end, claimed_end, false, None));
        if let Err(e) = result {
            let _ = self.release_range(begin, end, false, None);
            return Err(e);
        }
        Ok(true)
    }

    /// Releases the unit range `[begin, end)`, coalescing buddies.
    ///
    /// `rtl` releases right-to-left, used when extra space before a range
    /// must come back inside-out. With `payload` given, blocks above the
    /// decommit level return their pages to the port.
    pub fn release(&self, begin: usize, end: usize, payload: Option<Payload>) -> Result<()> {
        self.release_range(begin, end, false, payload)
    }

    fn release_range(
        &self,
        mut begin: usize,
        mut end: usize,
        rtl: bool,
        payload: Option<Payload>,
    ) -> Result<()> {
        if begin > end || end > self.size.unit_count() {
            return Err(MemError::BadParam);
        }
        let tbw = self.size.top_bitmap_words();

        // Blocks at levels below this bound are large enough to hand their
        // pages back to the port.
        let decommit_levels_end = payload.map_or(0, |p| {
            let optimal = Memory::query(std::ptr::null(), nirvana_port::QueryParam::OptimalCommitUnit);
            let ratio = optimal / p.unit_size;
            if ratio == 0 || ratio > MAX_BLOCK_UNITS {
                0
            } else {
                HEAP_LEVELS.saturating_sub((usize::BITS - 1 - ratio.leading_zeros()) as usize)
            }
        });

        while begin < end {
            let (mut level, block_begin) = if rtl {
                let level = Self::level_align(end, end - begin);
                (level, end - Self::block_units(level))
            } else {
                (Self::level_align(begin, end - begin), begin)
            };

            let mut bl = block_begin >> (HEAP_LEVELS - 1 - level);
            let mut w = Self::bitmap_offset(level, tbw) + bl / WORD_BITS;
            let mut mask = 1usize << (bl % WORD_BITS);
            // The bit must be writable whatever happens next.
            self.commit_word(w)?;

            // Merge with free companions upward.
            while level > 0 {
                let companion_mask = if bl & 1 == 1 { mask >> 1 } else { mask << 1 };
                let cnt = self.counter(level, bl);
                if !acquire(cnt) {
                    break;
                }
                if bit_clear(self.word(w), companion_mask) {
                    let (old_w, old_mask) = (w, companion_mask);
                    level -= 1;
                    bl >>= 1;
                    mask = 1usize << (bl % WORD_BITS);
                    w = Self::bitmap_offset(level, tbw) + bl / WORD_BITS;
                    if let Err(e) = self.commit_word(w) {
                        bit_set(self.word(old_w), old_mask);
                        release_cnt(cnt);
                        return Err(e);
                    }
                } else {
                    release_cnt(cnt);
                    break;
                }
            }

            if level < decommit_levels_end {
                if let Some(p) = payload {
                    let unit = bl << (HEAP_LEVELS - 1 - level);
                    // SAFETY: payload geometry comes from the owning
                    // partition.
                    let addr = unsafe { p.base.add(unit * p.unit_size) };
                    Memory::decommit(addr, Self::block_units(level) * p.unit_size)?;
                }
            }

            bit_set(self.word(w), mask);
            release_cnt(self.counter(level, bl));

            if rtl {
                end = block_begin;
            } else {
                begin = block_begin + Self::block_units(level);
            }
        }
        Ok(())
    }

    /// Verifies that every unit in `[begin, end)` is allocated: the
    /// range's projection is clear on every level.
    pub fn check_allocated(&self, begin: usize, end: usize) -> bool {
        if begin >= end || end > self.size.unit_count() {
            return false;
        }
        let tbw = self.size.top_bitmap_words();
        let (mut begin, mut end) = (begin, end);
        for level in (0..HEAP_LEVELS).rev() {
            let level_begin = Self::bitmap_offset(level, tbw);
            let first = level_begin + begin / WORD_BITS;
            let last = level_begin + (end - 1) / WORD_BITS;
            let begin_mask = !0usize << (begin % WORD_BITS);
            let end_mask = !0usize >> (WORD_BITS - 1 - (end - 1) % WORD_BITS);

            let mut w = first;
            while w <= last {
                if !self.word_readable(w) {
                    // Uncommitted words hold no free bits.
                    let page = nirvana_port::commit_unit();
                    let next = (self.word_addr(w) as usize / page + 1) * page;
                    w = first
                        + (next.saturating_sub(self.word_addr(first) as usize)) / WORD_BYTES;
                    continue;
                }
                let mut bits = self.word(w).load(Ordering::Acquire);
                if w == first {
                    bits &= begin_mask;
                }
                if w == last {
                    bits &= end_mask;
                }
                if bits != 0 {
                    return false;
                }
                w += 1;
            }

            begin /= 2;
            end = (end + 1) / 2;
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn counter_snapshot(&self) -> Vec<u16> {
        (0..self.size.index_len())
            .map(|i| self.counter_at(i).load(Ordering::Acquire))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn popcount_per_counter(&self) -> Vec<u16> {
        let tbw = self.size.top_bitmap_words();
        let mut out = vec![0u32; self.size.index_len()];
        for level in 0..HEAP_LEVELS {
            let level_begin = Self::bitmap_offset(level, tbw);
            let words = tbw << level;
            for i in 0..words {
                let bits = self.word(level_begin + i).load(Ordering::Acquire);
                if bits != 0 {
                    let block0 = i * WORD_BITS;
                    for b in 0..WORD_BITS {
                        if bits & (1usize << b) != 0 {
                            let slot = self.size.block_index_offset(HEAP_LEVELS - 1 - level)
                                + ((block0 + b) >> COUNTER_SPAN_BITS.trailing_zeros());
                            out[slot] += 1;
                        }
                    }
                }
            }
        }
        out.into_iter().map(|c| c as u16).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    struct Buf {
        mem: Vec<usize>,
    }

    impl Buf {
        fn new(size: DirectorySize) -> (Buf, HeapDirectory) {
            let mut buf = Buf {
                mem: vec![0usize; size.bytes() / WORD_BYTES],
            };
            let dir =
                unsafe { HeapDirectory::new(buf.mem.as_mut_ptr() as *mut u8, size, false) }
                    .unwrap();
            dir.initialize().unwrap();
            (buf, dir)
        }
    }

    const SIZES: [DirectorySize; 3] = [
        DirectorySize::Small,
        DirectorySize::Medium,
        DirectorySize::Large,
    ];

    #[test]
    fn fresh_directory_is_empty() {
        for size in SIZES {
            let (_buf, dir) = Buf::new(size);
            assert!(dir.empty(), "{size:?}");
        }
    }

    #[test]
    fn counters_match_bitmap_population() {
        for size in SIZES {
            let (_buf, dir) = Buf::new(size);
            assert_eq!(dir.counter_snapshot(), dir.popcount_per_counter());

            let a = dir.allocate(1).unwrap();
            let b = dir.allocate(100).unwrap();
            let c = dir.allocate(1024).unwrap();
            assert_eq!(dir.counter_snapshot(), dir.popcount_per_counter());

            dir.release(b, b + 100, None).unwrap();
            assert_eq!(dir.counter_snapshot(), dir.popcount_per_counter());
            dir.release(a, a + 1, None).unwrap();
            dir.release(c, c + 1024, None).unwrap();
            assert_eq!(dir.counter_snapshot(), dir.popcount_per_counter());
            assert!(dir.empty());
        }
    }

    #[test]
    fn allocate_release_round_trip_restores_counters() {
        for size in SIZES {
            let (_buf, dir) = Buf::new(size);
            let before = dir.counter_snapshot();
            for units in [1usize, 2, 3, 5, 16, 100, 511, 512, 1000, 1024] {
                let off = dir.allocate(units).unwrap();
                dir.release(off, off + units, None).unwrap();
                assert_eq!(dir.counter_snapshot(), before, "{size:?} units={units}");
            }
            assert!(dir.empty());
        }
    }

    #[test]
    fn power_of_two_blocks_are_naturally_aligned() {
        let (_buf, dir) = Buf::new(DirectorySize::Large);
        let mut live = Vec::new();
        for k in 0..=10usize {
            let units = 1 << k;
            let off = dir.allocate(units).unwrap();
            assert_eq!(off % units, 0, "2^{k} units at offset {off}");
            live.push((off, units));
        }
        for (off, units) in live {
            dir.release(off, off + units, None).unwrap();
        }
        assert!(dir.empty());
    }

    #[test]
    fn allocations_never_overlap() {
        let mut rng = StdRng::seed_from_u64(0x6e697276);
        for size in SIZES {
            let (_buf, dir) = Buf::new(size);
            let mut live: Vec<(usize, usize)> = Vec::new();
            for _ in 0..2000 {
                if live.is_empty() || rng.gen_bool(0.6) {
                    let units = rng.gen_range(1..=MAX_BLOCK_UNITS);
                    match dir.allocate(units) {
                        Ok(off) => {
                            for &(o, u) in &live {
                                assert!(off + units <= o || o + u <= off, "overlap");
                            }
                            assert!(dir.check_allocated(off, off + units));
                            live.push((off, units));
                        }
                        Err(MemError::NoMemory) => {}
                        Err(e) => panic!("{e}"),
                    }
                } else {
                    let i = rng.gen_range(0..live.len());
                    let (off, units) = live.swap_remove(i);
                    dir.release(off, off + units, None).unwrap();
                }
            }
            for (off, units) in live.drain(..) {
                dir.release(off, off + units, None).unwrap();
            }
            assert!(dir.empty());
            assert_eq!(dir.counter_snapshot(), dir.popcount_per_counter());
        }
    }

    #[test]
    fn explicit_range_claims() {
        let (_buf, dir) = Buf::new(DirectorySize::Large);
        assert!(dir.allocate_range(5, 12).unwrap());
        assert!(dir.check_allocated(5, 12));
        // Overlapping claim fails and rolls back.
        assert!(!dir.allocate_range(0, 8).unwrap());
        assert!(!dir.check_allocated(0, 5));
        dir.release(5, 12, None).unwrap();
        assert!(dir.empty());
        assert_eq!(dir.counter_snapshot(), dir.popcount_per_counter());
    }

    #[test]
    fn exhaustion_is_complete_and_reversible() {
        let (_buf, dir) = Buf::new(DirectorySize::Small);
        let mut got = 0usize;
        let mut live = Vec::new();
        loop {
            match dir.allocate(MAX_BLOCK_UNITS) {
                Ok(off) => {
                    got += MAX_BLOCK_UNITS;
                    live.push(off);
                }
                Err(MemError::NoMemory) => break,
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(got, DirectorySize::Small.unit_count());
        assert!(dir.allocate(1).is_err());
        for off in live {
            dir.release(off, off + MAX_BLOCK_UNITS, None).unwrap();
        }
        assert!(dir.empty());
    }

    #[test]
    fn concurrent_allocate_release_keeps_books() {
        let (buf, dir) = Buf::new(DirectorySize::Large);
        std::thread::scope(|s| {
            for t in 0..4 {
                let dir = dir;
                s.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(t);
                    let mut live = Vec::new();
                    for _ in 0..500 {
                        if live.is_empty() || rng.gen_bool(0.55) {
                            let units = rng.gen_range(1..=64usize);
                            if let Ok(off) = dir.allocate(units) {
                                live.push((off, units));
                            }
                        } else {
                            let i = rng.gen_range(0..live.len());
                            let (off, units) = live.swap_remove(i);
                            dir.release(off, off + units, None).unwrap();
                        }
                    }
                    for (off, units) in live {
                        dir.release(off, off + units, None).unwrap();
                    }
                });
            }
        });
        assert!(dir.empty());
        assert_eq!(dir.counter_snapshot(), dir.popcount_per_counter());
        drop(buf);
    }
}
