// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

//! Multi-partition heap.
//!
//! A heap serves blocks of one allocation unit out of a chain of
//! partitions; requests above the largest directory block go straight to
//! the port. The partition chain grows by lock-free tail append: a thread
//! that loses the append race allocates from the winner's partition and
//! throws its own away.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use nirvana_port::{AllocFlags, MemError, Memory, Result};

use crate::config::{HEAP_DIRECTORY_SIZE, HEAP_UNIT_DEFAULT, HEAP_UNIT_MAX, HEAP_UNIT_MIN};
use crate::directory::MAX_BLOCK_UNITS;
use crate::partition::{table, Partition};

pub struct Heap {
    unit: usize,
    head: AtomicPtr<Partition>,
    outstanding: AtomicUsize,
}

impl Heap {
    /// Creates a heap with the given allocation unit (a power of two in
    /// `[HEAP_UNIT_MIN, HEAP_UNIT_MAX]`). Partitions are reserved lazily
    /// on first allocation.
    pub fn new(unit: usize) -> Result<Heap> {
        if !unit.is_power_of_two() || !(HEAP_UNIT_MIN..=HEAP_UNIT_MAX).contains(&unit) {
            return Err(MemError::BadParam);
        }
        Ok(Heap {
            unit,
            head: AtomicPtr::new(std::ptr::null_mut()),
            outstanding: AtomicUsize::new(0),
        })
    }

    pub fn with_default_unit() -> Heap {
        Heap {
            unit: HEAP_UNIT_DEFAULT,
            head: AtomicPtr::new(std::ptr::null_mut()),
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn allocation_unit(&self) -> usize {
        self.unit
    }

    /// Largest request the partitions serve; anything bigger goes to the
    /// port.
    pub fn max_block_size(&self) -> usize {
        MAX_BLOCK_UNITS * self.unit
    }

    /// Bytes currently allocated and not yet released (including blocks
    /// adopted from other heaps).
    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// No outstanding blocks.
    pub fn empty(&self) -> bool {
        self.outstanding_bytes() == 0
    }

    /// Number of partitions in the chain.
    pub fn partition_count(&self) -> usize {
        let mut n = 0;
        let mut p = self.head.load(Ordering::Acquire);
        while !p.is_null() {
            n += 1;
            // SAFETY: linked partitions live until the heap drops.
            p = unsafe { &*p }.next.load(Ordering::Acquire);
        }
        n
    }

    pub fn allocate(&self, size: usize) -> Result<*mut u8> {
        self.allocate_with(size, AllocFlags::empty())
    }

    /// Allocation with port flags. Reservation and read-only requests are
    /// always served at the port level, like oversized blocks.
    pub fn allocate_with(&self, size: usize, flags: AllocFlags) -> Result<*mut u8> {
        if size == 0 {
            return Err(MemError::BadParam);
        }
        if size > self.max_block_size()
            || flags.intersects(AllocFlags::RESERVED | AllocFlags::READ_ONLY)
        {
            let p = Memory::allocate(std::ptr::null_mut(), size, flags)?;
            self.outstanding.fetch_add(size, Ordering::AcqRel);
            return Ok(p);
        }
        let units = size.div_ceil(self.unit);

        // Walk existing partitions.
        let mut tail: *mut Partition = std::ptr::null_mut();
        let mut p = self.head.load(Ordering::Acquire);
        while !p.is_null() {
            // SAFETY: linked partitions live until the heap drops.
            let part = unsafe { &*p };
            if let Some(ptr) = self.try_partition(part, units, size)? {
                return Ok(ptr);
            }
            tail = p;
            p = part.next.load(Ordering::Acquire);
        }

        // Every partition is full: grow the chain.
        let fresh = Partition::create(self.unit, HEAP_DIRECTORY_SIZE)?;
        let mut link = if tail.is_null() {
            &self.head
        } else {
            // SAFETY: tail stays linked.
            &unsafe { &*tail }.next
        };
        loop {
            match link.compare_exchange(
                std::ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(winner) => {
                    // Another thread appended first; use its partition if
                    // it has room and drop ours.
                    // SAFETY: linked partitions are alive.
                    let part = unsafe { &*winner };
                    if let Some(ptr) = self.try_partition(part, units, size)? {
                        Partition::destroy(fresh)?;
                        return Ok(ptr);
                    }
                    link = &part.next;
                }
            }
        }
        // SAFETY: just linked; alive.
        let part = unsafe { &*fresh };
        match self.try_partition(part, units, size)? {
            Some(ptr) => Ok(ptr),
            // A fresh partition that cannot serve the request means the
            // books are broken.
            None => Err(MemError::Internal),
        }
    }

    fn try_partition(
        &self,
        part: &Partition,
        units: usize,
        size: usize,
    ) -> Result<Option<*mut u8>> {
        if part.poisoned() {
            return Ok(None);
        }
        match part.directory().allocate(units) {
            Ok(unit_off) => {
                // SAFETY: unit offset is inside the payload.
                let ptr = unsafe { part.payload().add(unit_off * self.unit) };
                if let Err(e) = Memory::commit(ptr, size) {
                    let _ = part
                        .directory()
                        .release(unit_off, unit_off + units, None);
                    return Err(e);
                }
                self.outstanding.fetch_add(size, Ordering::AcqRel);
                Ok(Some(ptr))
            }
            Err(MemError::NoMemory) => Ok(None),
            Err(MemError::Internal) => {
                tracing::warn!(payload = ?part.payload(), "partition poisoned after bookkeeping corruption");
                part.poison();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Releases a block. A range that runs past its partition's payload
    /// is a supported case: the port-backed tail is released first, then
    /// the in-partition head (two-stage free).
    pub fn release(&self, ptr: *mut u8, size: usize) -> Result<()> {
        if ptr.is_null() || size == 0 {
            return Ok(());
        }
        match table().find(ptr) {
            Some(part) => {
                let (begin, units, tail) = Self::partition_span(part, ptr, size)?;
                if !part.directory().check_allocated(begin, begin + units) {
                    return Err(MemError::BadParam);
                }
                if let Some((tail_ptr, tail_len)) = tail {
                    Memory::release(tail_ptr, tail_len)?;
                }
                part.directory()
                    .release(begin, begin + units, Some(part.payload_ctx()))?;
            }
            None => Memory::release(ptr, size)?,
        }
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(size))
            });
        Ok(())
    }

    /// Validates that the whole range is allocated (heap-managed part of
    /// it; a large port block has no bitmap to consult).
    pub fn check_allocated(&self, ptr: *const u8, size: usize) -> Result<()> {
        if ptr.is_null() || size == 0 {
            return Err(MemError::BadParam);
        }
        if let Some(part) = table().find(ptr) {
            let (begin, units, _) = Self::partition_span(part, ptr as *mut u8, size)?;
            if !part.directory().check_allocated(begin, begin + units) {
                return Err(MemError::BadParam);
            }
        }
        Ok(())
    }

    /// Splits a released range into its in-partition unit span and the
    /// straddling port-backed tail, validating alignment.
    fn partition_span(
        part: &Partition,
        ptr: *mut u8,
        size: usize,
    ) -> Result<(usize, usize, Option<(*mut u8, usize)>)> {
        let payload = part.payload() as usize;
        let p = ptr as usize;
        if p < payload {
            return Err(MemError::BadParam);
        }
        let off = p - payload;
        if off % part.unit() != 0 {
            return Err(MemError::BadParam);
        }
        let payload_end = part.payload_end() as usize;
        let end = p + size;
        let in_heap_end = end.min(payload_end);
        let units = (in_heap_end - p).div_ceil(part.unit());
        let tail = (end > payload_end)
            .then(|| (payload_end as *mut u8, end - payload_end));
        Ok((off / part.unit(), units, tail))
    }

    /// Transfers ownership of a block from another heap.
    ///
    /// With equal allocation units both heaps resolve the block through
    /// the same partition table, so the transfer is a zero-copy adoption:
    /// only the outstanding accounting moves. Otherwise the content is
    /// copied into this heap and the source block released.
    pub fn move_from(&self, source: &Heap, ptr: *mut u8, size: usize) -> Result<*mut u8> {
        if ptr.is_null() || size == 0 {
            return Err(MemError::BadParam);
        }
        if self.unit == source.unit {
            source.check_allocated(ptr, size)?;
            let _ = source
                .outstanding
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    Some(v.saturating_sub(size))
                });
            self.outstanding.fetch_add(size, Ordering::AcqRel);
            return Ok(ptr);
        }
        let dst = self.allocate(size)?;
        if let Err(e) = Memory::copy(dst, ptr, size, AllocFlags::empty()) {
            let _ = self.release(dst, size);
            return Err(e);
        }
        source.release(ptr, size)?;
        Ok(dst)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let leaked = self.outstanding.load(Ordering::Acquire);
        if leaked != 0 {
            tracing::warn!(bytes = leaked, unit = self.unit, "heap dropped with outstanding allocations");
        }
        let mut p = self.head.load(Ordering::Acquire);
        while !p.is_null() {
            // SAFETY: exclusive in drop.
            let part = unsafe { &*p };
            let next = part.next.load(Ordering::Acquire);
            if part.directory().empty() {
                if let Err(e) = Partition::destroy(p) {
                    tracing::warn!(error = %e, "partition release failed");
                }
            } else {
                // Blocks are still live (possibly adopted by another
                // heap); the partition stays registered so they remain
                // releasable.
                tracing::warn!(payload = ?part.payload(), "partition leaked: blocks still allocated");
            }
            p = next;
        }
    }
}
