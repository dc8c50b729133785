// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

//! Heap partitions and the global partition table.
//!
//! A partition is one port-reserved region: the directory header followed
//! by the payload units. The table maps any address inside a partition
//! back to it, so `release` can find the owning directory without knowing
//! which heap allocated the pointer. Second-level table blocks come into
//! existence on first use, claimed by compare-and-swap.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::OnceLock;

use nirvana_port::{AllocFlags, Memory, Result, BLOCK_SIZE};

use crate::directory::{DirectorySize, HeapDirectory, Payload};

pub(crate) struct Partition {
    base: *mut u8,
    unit: usize,
    dir_size: DirectorySize,
    pub(crate) next: AtomicPtr<Partition>,
    poisoned: AtomicBool,
}

// SAFETY: the raw base pointer is only used through atomic directory
// accesses and port calls.
unsafe impl Send for Partition {}
unsafe impl Sync for Partition {}

impl Partition {
    /// Reserves a region, initializes its directory, and registers the
    /// partition. The payload stays uncommitted until allocations touch
    /// it.
    pub(crate) fn create(unit: usize, dir_size: DirectorySize) -> Result<*mut Partition> {
        let region = dir_size.bytes() + dir_size.unit_count() * unit;
        let base = Memory::allocate(
            std::ptr::null_mut(),
            region,
            AllocFlags::RESERVED | AllocFlags::ZERO_INIT,
        )?;
        // SAFETY: `base` is a fresh reserved region of at least
        // `dir_size.bytes()` bytes.
        let dir = match unsafe { HeapDirectory::new(base, dir_size, true) } {
            Ok(d) => d,
            Err(e) => {
                let _ = Memory::release(base, region);
                return Err(e);
            }
        };
        if let Err(e) = dir.initialize() {
            let _ = Memory::release(base, region);
            return Err(e);
        }
        let part = Box::into_raw(Box::new(Partition {
            base,
            unit,
            dir_size,
            next: AtomicPtr::new(std::ptr::null_mut()),
            poisoned: AtomicBool::new(false),
        }));
        // SAFETY: just created, fully initialized.
        table().register(unsafe { &*part });
        tracing::debug!(base = ?base, unit, region, "heap partition created");
        Ok(part)
    }

    /// Unregisters and frees a partition. The caller guarantees no live
    /// allocations remain inside.
    pub(crate) fn destroy(part: *mut Partition) -> Result<()> {
        // SAFETY: pointer came from `create`; exclusive by caller contract.
        let part = unsafe { Box::from_raw(part) };
        table().unregister(&part);
        Memory::release(part.base, part.region_size())
    }

    pub(crate) fn directory(&self) -> HeapDirectory {
        // SAFETY: the region was validated at creation and lives as long
        // as the partition.
        unsafe { HeapDirectory::new(self.base, self.dir_size, true) }
            .unwrap_or_else(|_| unreachable!())
    }

    pub(crate) fn unit(&self) -> usize {
        self.unit
    }

    pub(crate) fn payload(&self) -> *mut u8 {
        // SAFETY: within the reserved region.
        unsafe { self.base.add(self.dir_size.bytes()) }
    }

    pub(crate) fn payload_end(&self) -> *mut u8 {
        // SAFETY: one past the reserved region's payload.
        unsafe { self.payload().add(self.dir_size.unit_count() * self.unit) }
    }

    pub(crate) fn region_size(&self) -> usize {
        self.dir_size.bytes() + self.dir_size.unit_count() * self.unit
    }

    pub(crate) fn contains(&self, addr: *const u8) -> bool {
        let a = addr as usize;
        a >= self.base as usize && a < self.payload_end() as usize
    }

    pub(crate) fn payload_ctx(&self) -> Payload {
        Payload {
            base: self.payload(),
            unit_size: self.unit,
        }
    }

    pub(crate) fn poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Marks the partition unusable for new allocations after detected
    /// bookkeeping corruption. Existing blocks stay releasable.
    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }
}

// Granule of the partition table: partitions are block-aligned and at
// least one block long, so one slot per address-space block suffices.
const GRANULE: usize = BLOCK_SIZE;
const LEAF_BITS: usize = 16;
const TOP_BITS: usize = 15;
const LEAF_LEN: usize = 1 << LEAF_BITS;
const TOP_LEN: usize = 1 << TOP_BITS;

pub(crate) struct PartitionTable {
    top: Box<[AtomicUsize]>,
}

pub(crate) fn table() -> &'static PartitionTable {
    static TABLE: OnceLock<PartitionTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut top = Vec::with_capacity(TOP_LEN);
        top.resize_with(TOP_LEN, || AtomicUsize::new(0));
        PartitionTable {
            top: top.into_boxed_slice(),
        }
    })
}

impl PartitionTable {
    fn leaf(&self, i0: usize, create: bool) -> Option<&[AtomicPtr<Partition>]> {
        if i0 >= TOP_LEN {
            return None;
        }
        let cur = self.top[i0].load(Ordering::Acquire);
        let ptr = if cur != 0 {
            cur as *mut AtomicPtr<Partition>
        } else {
            if !create {
                return None;
            }
            let mut fresh: Vec<AtomicPtr<Partition>> = Vec::with_capacity(LEAF_LEN);
            fresh.resize_with(LEAF_LEN, || AtomicPtr::new(std::ptr::null_mut()));
            let fresh = Box::into_raw(fresh.into_boxed_slice()) as *mut AtomicPtr<Partition>;
            match self.top[i0].compare_exchange(
                0,
                fresh as usize,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => fresh,
                Err(cur) => {
                    // SAFETY: ours lost the race and was never shared.
                    drop(unsafe {
                        Box::from_raw(std::ptr::slice_from_raw_parts_mut(fresh, LEAF_LEN))
                    });
                    cur as *mut AtomicPtr<Partition>
                }
            }
        };
        // SAFETY: leaf tables are never freed once published.
        Some(unsafe { std::slice::from_raw_parts(ptr, LEAF_LEN) })
    }

    fn register(&self, part: &Partition) {
        let begin = part.base as usize / GRANULE;
        let end = (part.payload_end() as usize).div_ceil(GRANULE);
        let ptr = part as *const Partition as *mut Partition;
        for g in begin..end {
            if let Some(leaf) = self.leaf(g >> LEAF_BITS, true) {
                leaf[g & (LEAF_LEN - 1)].store(ptr, Ordering::Release);
            }
        }
    }

    fn unregister(&self, part: &Partition) {
        let begin = part.base as usize / GRANULE;
        let end = (part.payload_end() as usize).div_ceil(GRANULE);
        for g in begin..end {
            if let Some(leaf) = self.leaf(g >> LEAF_BITS, false) {
                leaf[g & (LEAF_LEN - 1)].store(std::ptr::null_mut(), Ordering::Release);
            }
        }
    }

    /// The partition owning `addr`, if any heap-managed partition covers
    /// it.
    pub(crate) fn find(&self, addr: *const u8) -> Option<&Partition> {
        let g = addr as usize / GRANULE;
        let i0 = g >> LEAF_BITS;
        if i0 >= TOP_LEN {
            return None;
        }
        let leaf = self.leaf(i0, false)?;
        let p = leaf[g & (LEAF_LEN - 1)].load(Ordering::Acquire);
        if p.is_null() {
            return None;
        }
        // SAFETY: registered partitions stay alive until unregistered,
        // and unregistration requires the region to be dead.
        let part = unsafe { &*p };
        part.contains(addr).then_some(part)
    }
}
