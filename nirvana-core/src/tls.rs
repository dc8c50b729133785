// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

//! Thread-local storage slots.
//!
//! Indexes are allocated process-wide from a bitmap; each holder (an
//! execution domain, or a memory context's slot vector) stores values
//! with optional destructors. On teardown the entries are destructed in
//! reverse store order.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use nirvana_port::MemError;

/// Destructor invoked for a stored value when its holder is cleared.
pub type Deleter = unsafe fn(*mut c_void);

/// Limit of the user TLS indexes.
pub const USER_TLS_INDEXES: usize = 64;

static BITMAP: AtomicU64 = AtomicU64::new(0);

/// Allocates a process-wide TLS index.
pub fn alloc() -> Result<usize> {
    let mut cur = BITMAP.load(Ordering::Acquire);
    loop {
        let free = !cur;
        if free == 0 {
            return Err(MemError::NoMemory.into());
        }
        let idx = free.trailing_zeros() as usize;
        match BITMAP.compare_exchange_weak(
            cur,
            cur | (1 << idx),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return Ok(idx),
            Err(c) => cur = c,
        }
    }
}

/// Frees a TLS index. Values already stored under it stay owned by their
/// holders until those are cleared.
pub fn free(idx: usize) {
    if idx < USER_TLS_INDEXES {
        BITMAP.fetch_and(!(1u64 << idx), Ordering::AcqRel);
    }
}

struct Entry {
    ptr: *mut c_void,
    deleter: Option<Deleter>,
    order: u64,
}

impl Entry {
    fn destruct(&mut self) {
        if let (Some(deleter), false) = (self.deleter.take(), self.ptr.is_null()) {
            // SAFETY: deleter/value pairing is the caller's contract from
            // `set`.
            unsafe { deleter(self.ptr) };
        }
    }
}

/// One holder's slot vector.
pub struct TlsContext {
    entries: Vec<Option<Entry>>,
    next_order: u64,
}

// SAFETY: holders hand values across threads deliberately; the deleter
// contract requires the stored values to tolerate that.
unsafe impl Send for TlsContext {}

impl TlsContext {
    pub fn new() -> TlsContext {
        TlsContext {
            entries: Vec::new(),
            next_order: 0,
        }
    }

    /// Stores a value under an allocated index. A previously stored value
    /// is destructed first.
    pub fn set(&mut self, idx: usize, ptr: *mut c_void, deleter: Option<Deleter>) -> Result<()> {
        if idx >= USER_TLS_INDEXES {
            return Err(MemError::BadParam.into());
        }
        if self.entries.len() <= idx {
            self.entries.resize_with(idx + 1, || None);
        }
        if let Some(old) = &mut self.entries[idx] {
            old.destruct();
        }
        let order = self.next_order;
        self.next_order += 1;
        self.entries[idx] = Some(Entry {
            ptr,
            deleter,
            order,
        });
        Ok(())
    }

    pub fn get(&self, idx: usize) -> *mut c_void {
        self.entries
            .get(idx)
            .and_then(|e| e.as_ref())
            .map_or(std::ptr::null_mut(), |e| e.ptr)
    }

    /// Destructs all entries in reverse store order.
    pub fn clear(&mut self) {
        let mut entries: Vec<Entry> = self.entries.iter_mut().filter_map(Option::take).collect();
        entries.sort_by(|a, b| b.order.cmp(&a.order));
        for mut e in entries {
            e.destruct();
        }
    }
}

impl Default for TlsContext {
    fn default() -> TlsContext {
        TlsContext::new()
    }
}

impl Drop for TlsContext {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Separate recorders per test; the harness runs tests concurrently.
    static DESTROYED_A: AtomicUsize = AtomicUsize::new(0);
    static LAST_A: AtomicUsize = AtomicUsize::new(0);
    static DESTROYED_B: AtomicUsize = AtomicUsize::new(0);
    static LAST_B: AtomicUsize = AtomicUsize::new(0);

    unsafe fn record_a(p: *mut c_void) {
        DESTROYED_A.fetch_add(1, Ordering::SeqCst);
        LAST_A.store(p as usize, Ordering::SeqCst);
    }

    unsafe fn record_b(p: *mut c_void) {
        DESTROYED_B.fetch_add(1, Ordering::SeqCst);
        LAST_B.store(p as usize, Ordering::SeqCst);
    }

    #[test]
    fn indexes_are_unique_and_reusable() {
        let a = alloc().unwrap();
        let b = alloc().unwrap();
        assert_ne!(a, b);
        free(a);
        let c = alloc().unwrap();
        assert_eq!(a, c);
        free(b);
        free(c);
    }

    #[test]
    fn entries_destruct_in_reverse_store_order() {
        let mut ctx = TlsContext::new();
        ctx.set(3, 1 as *mut c_void, Some(record_a)).unwrap();
        ctx.set(1, 2 as *mut c_void, Some(record_a)).unwrap();
        ctx.set(5, 3 as *mut c_void, Some(record_a)).unwrap();
        assert_eq!(ctx.get(1), 2 as *mut c_void);
        assert!(ctx.get(0).is_null());
        ctx.clear();
        assert_eq!(DESTROYED_A.load(Ordering::SeqCst), 3);
        // Entry stored first (value 1) is destructed last.
        assert_eq!(LAST_A.load(Ordering::SeqCst), 1);
        assert!(ctx.get(3).is_null());
    }

    #[test]
    fn replacing_a_value_destructs_the_old_one() {
        let mut ctx = TlsContext::new();
        ctx.set(0, 7 as *mut c_void, Some(record_b)).unwrap();
        ctx.set(0, 8 as *mut c_void, Some(record_b)).unwrap();
        assert_eq!(DESTROYED_B.load(Ordering::SeqCst), 1);
        assert_eq!(LAST_B.load(Ordering::SeqCst), 7);
        ctx.clear();
        assert_eq!(DESTROYED_B.load(Ordering::SeqCst), 2);
    }
}
