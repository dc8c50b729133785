// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

//! Memory contexts.
//!
//! A memory context groups the per-execution resources that outlive a
//! single call: the user heap, and — created only on first use — the
//! runtime-proxy map, the TLS slot vector, the file-descriptor table and
//! the current directory. It is shared by every execution domain that
//! pushes it; the last release destroys it, heap last, so everything
//! allocated through the heap is freed first.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, MutexGuard};

use crate::error::Result;
use crate::exec_domain::RestrictedMode;
use crate::tls::TlsContext;
use nirvana_heap::Heap;
use nirvana_port::MemError;

pub type MemContextRef = Arc<MemContext>;

/// Tracks the liveness of a registered object for runtime support
/// (iterator debugging and the like). Stays valid after the object is
/// removed; `object()` then reports null.
#[derive(Clone)]
pub struct RuntimeProxy(Arc<AtomicUsize>);

impl RuntimeProxy {
    fn new(object: *const ()) -> RuntimeProxy {
        RuntimeProxy(Arc::new(AtomicUsize::new(object as usize)))
    }

    pub fn object(&self) -> *const () {
        self.0.load(Ordering::Acquire) as *const ()
    }

    fn remove(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// Substrate-owned file-descriptor table.
pub struct FdTable {
    slots: Vec<Option<OwnedFd>>,
}

impl FdTable {
    fn new() -> FdTable {
        FdTable { slots: Vec::new() }
    }

    /// Installs a descriptor in the lowest free slot.
    pub fn install(&mut self, fd: OwnedFd) -> usize {
        match self.slots.iter_mut().position(|s| s.is_none()) {
            Some(i) => {
                self.slots[i] = Some(fd);
                i
            }
            None => {
                self.slots.push(Some(fd));
                self.slots.len() - 1
            }
        }
    }

    /// Duplicates the descriptor held in a slot.
    pub fn duplicate(&self, idx: usize) -> Result<OwnedFd> {
        let fd = self
            .slots
            .get(idx)
            .and_then(Option::as_ref)
            .ok_or(MemError::BadParam)?;
        fd.try_clone()
            .map_err(|e| MemError::Os { op: "dup", source: e }.into())
    }

    pub fn close(&mut self, idx: usize) -> Result<()> {
        match self.slots.get_mut(idx).and_then(Option::take) {
            Some(fd) => {
                drop(fd);
                Ok(())
            }
            None => Err(MemError::BadParam.into()),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Created on demand; most contexts never touch any of this.
struct Data {
    proxies: Mutex<HashMap<usize, RuntimeProxy>>,
    tls: Mutex<TlsContext>,
    files: Mutex<FdTable>,
    current_dir: Mutex<Option<PathBuf>>,
}

impl Drop for Data {
    fn drop(&mut self) {
        // Live proxy handles outlive the context; report their objects
        // gone.
        for proxy in self.proxies.get_mut().values() {
            proxy.remove();
        }
    }
}

pub struct MemContext {
    // Declared before the heap: dropped first, so proxies, TLS values and
    // descriptors go away while their storage is still valid.
    data: OnceLock<Box<Data>>,
    heap: Heap,
}

impl MemContext {
    /// Creates a context with a default-unit user heap.
    pub fn create() -> MemContextRef {
        Arc::new(MemContext {
            data: OnceLock::new(),
            heap: Heap::with_default_unit(),
        })
    }

    pub fn with_heap(heap: Heap) -> MemContextRef {
        Arc::new(MemContext {
            data: OnceLock::new(),
            heap,
        })
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    fn data(&self) -> &Data {
        self.data.get_or_init(|| {
            Box::new(Data {
                proxies: Mutex::new(HashMap::new()),
                tls: Mutex::new(TlsContext::new()),
                files: Mutex::new(FdTable::new()),
                current_dir: Mutex::new(None),
            })
        })
    }

    /// Returns the runtime proxy registered for `object`, creating one on
    /// first request.
    pub fn runtime_proxy_get(&self, object: *const ()) -> RuntimeProxy {
        let mut proxies = self.data().proxies.lock();
        proxies
            .entry(object as usize)
            .or_insert_with(|| RuntimeProxy::new(object))
            .clone()
    }

    /// Unregisters `object`; outstanding proxy handles observe removal.
    pub fn runtime_proxy_remove(&self, object: *const ()) {
        if let Some(data) = self.data.get() {
            if let Some(proxy) = data.proxies.lock().remove(&(object as usize)) {
                proxy.remove();
            }
        }
    }

    /// Context-local TLS slot vector for process-wide keys.
    pub fn tls(&self) -> MutexGuard<'_, TlsContext> {
        self.data().tls.lock()
    }

    pub fn file_descriptors(&self) -> MutexGuard<'_, FdTable> {
        self.data().files.lock()
    }

    pub fn chdir(&self, path: PathBuf) {
        *self.data().current_dir.lock() = Some(path);
    }

    pub fn current_dir(&self) -> PathBuf {
        if let Some(data) = self.data.get() {
            if let Some(dir) = data.current_dir.lock().clone() {
                return dir;
            }
        }
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
    }
}

/// Drops a context reference. When it is the last one, teardown of the
/// owned resources runs — on a detached cleanup task when the releasing
/// domain permits it, synchronously otherwise (module init/terminate and
/// suppressed-GC modes must not schedule work that could outlive the
/// module).
pub(crate) fn release_from(ctx: MemContextRef, mode: RestrictedMode) {
    match Arc::try_unwrap(ctx) {
        Ok(ctx) => {
            if mode.allows_async_cleanup() {
                let spawned = std::thread::Builder::new()
                    .name("mem-context-cleanup".into())
                    .spawn(move || drop(ctx));
                if let Err(e) = spawned {
                    tracing::warn!(error = %e, "deferred cleanup unavailable, tearing down inline");
                }
            } else {
                drop(ctx);
            }
        }
        Err(_still_shared) => {}
    }
}

/// Releases a context reference from outside any execution domain.
pub fn release(ctx: MemContextRef) {
    let mode = crate::exec_domain::ExecDomain::with_current(|ed| ed.restricted_mode())
        .unwrap_or(RestrictedMode::Normal);
    release_from(ctx, mode);
}
