// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

//! Synchronization domains.
//!
//! A synchronization domain serializes entry to code that mutates a
//! memory context: at most one execution domain holds the domain, every
//! other arrival waits in a deadline-ordered queue. Leaving hands the
//! domain to the earliest deadline. There is no deadline boosting; a
//! waiter whose deadline shortens is re-keyed in place and fairness
//! relies on short critical sections.

use std::collections::HashMap;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::deadline::Deadline;
use crate::error::{CoreError, Result};
use crate::exec_domain::{ExecDomain, RestrictedMode};
use crate::mem_context::MemContextRef;
use crate::priority_queue::{ItemHandle, PriorityQueue};
use crate::runnable::Runnable;
use nirvana_heap::Heap;
use nirvana_port::MemError;

/// The synchronization capability an execution domain currently runs
/// under: a concrete domain, or the free context for read-only shared
/// code that synchronizes itself.
#[derive(Clone, Default)]
pub enum SyncContext {
    #[default]
    Free,
    Domain(Arc<SyncDomain>),
}

impl SyncContext {
    pub fn domain(&self) -> Option<&Arc<SyncDomain>> {
        match self {
            SyncContext::Free => None,
            SyncContext::Domain(d) => Some(d),
        }
    }
}

struct Inner {
    runner: Option<Arc<ExecDomain>>,
    /// Nested re-entries by the current holder.
    depth: usize,
    queue: PriorityQueue<Arc<ExecDomain>>,
    /// Waiter lookup for cancellation and re-keying.
    handles: HashMap<usize, ItemHandle>,
}

pub struct SyncDomain {
    mem: MemContextRef,
    inner: Mutex<Inner>,
}

fn ed_key(ed: &Arc<ExecDomain>) -> usize {
    Arc::as_ptr(ed) as usize
}

impl SyncDomain {
    pub fn new(mem: MemContextRef) -> Arc<SyncDomain> {
        Arc::new(SyncDomain {
            mem,
            inner: Mutex::new(Inner {
                runner: None,
                depth: 0,
                queue: PriorityQueue::new(),
                handles: HashMap::new(),
            }),
        })
    }

    pub fn mem_context(&self) -> &MemContextRef {
        &self.mem
    }

    /// The heap this domain guards.
    pub fn heap(&self) -> &Heap {
        self.mem.heap()
    }

    /// Pending execution domains.
    pub fn waiting(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Enters the domain, suspending until it is free. Re-entry by the
    /// current holder is a cheap no-op.
    pub fn enter(self: &Arc<Self>, ed: &Arc<ExecDomain>) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if let Some(runner) = &inner.runner {
                if Arc::ptr_eq(runner, ed) {
                    // Cheap re-entry by the current holder.
                    inner.depth += 1;
                    return Ok(());
                }
            }
            // During module init/terminate, hopping into another domain
            // would recurse into binding; refuse it.
            if matches!(
                ed.restricted_mode(),
                RestrictedMode::ClassLibraryInit | RestrictedMode::ModuleTerminate
            ) {
                if let Some(current) = ed.sync_context().domain() {
                    if !Arc::ptr_eq(current, self) {
                        return Err(CoreError::Mem(MemError::BadInvOrder));
                    }
                }
            }
            if inner.runner.is_none() {
                inner.runner = Some(ed.clone());
                drop(inner);
                ed.set_sync_context(SyncContext::Domain(self.clone()));
                return Ok(());
            }
            ed.suspend_prepare()?;
            let handle = inner.queue.insert(ed.deadline(), ed.clone());
            inner.handles.insert(ed_key(ed), handle);
        }
        ed.suspend_prepared();
        if ed.take_cancelled() {
            return Err(CoreError::Cancelled);
        }
        // leave() made us the runner before resuming us.
        ed.set_sync_context(SyncContext::Domain(self.clone()));
        Ok(())
    }

    /// Leaves the domain, handing it to the earliest-deadline waiter.
    pub fn leave(self: &Arc<Self>, ed: &Arc<ExecDomain>) -> Result<()> {
        let next = {
            let mut inner = self.inner.lock();
            match &inner.runner {
                Some(runner) if Arc::ptr_eq(runner, ed) => {}
                _ => return Err(CoreError::Mem(MemError::BadInvOrder)),
            }
            if inner.depth > 0 {
                inner.depth -= 1;
                return Ok(());
            }
            match inner.queue.remove_first() {
                Some((_, waiter)) => {
                    inner.handles.remove(&ed_key(&waiter));
                    inner.runner = Some(waiter.clone());
                    Some(waiter)
                }
                None => {
                    inner.runner = None;
                    None
                }
            }
        };
        ed.set_sync_context(SyncContext::Free);
        if let Some(waiter) = next {
            waiter.resume()?;
        }
        Ok(())
    }

    /// Re-keys a waiting domain after its deadline shortened.
    pub fn decrease_waiter_deadline(&self, ed: &Arc<ExecDomain>, deadline: Deadline) -> bool {
        let mut inner = self.inner.lock();
        match inner.handles.get(&ed_key(ed)).copied() {
            Some(handle) => {
                ed.set_deadline(deadline);
                inner.queue.decrease(handle, deadline)
            }
            None => false,
        }
    }

    /// Removes a waiting domain from the queue. It resumes with a
    /// cancellation error; the runnable's failure hook fires at the
    /// domain boundary.
    pub fn cancel(&self, ed: &Arc<ExecDomain>) -> Result<bool> {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.handles.remove(&ed_key(ed)) {
                Some(handle) => inner.queue.remove(handle).is_some(),
                None => false,
            }
        };
        if removed {
            ed.set_cancelled();
            ed.resume()?;
        }
        Ok(removed)
    }

    /// Schedules `runnable` to execute inside this domain on a new
    /// execution domain. The effective deadline is the minimum of the
    /// caller's current deadline and the requested one; this is how work
    /// hops between domains without blocking the sender.
    pub fn async_call(
        self: &Arc<Self>,
        runnable: Box<dyn Runnable>,
        deadline: Deadline,
        mem: Option<MemContextRef>,
    ) -> Result<Arc<ExecDomain>> {
        let effective = ExecDomain::with_current(|ed| ed.deadline())
            .map_or(deadline, |caller| caller.min(deadline));
        let mem = mem.unwrap_or_else(|| self.mem.clone());
        ExecDomain::spawn(
            Box::new(DomainCall {
                domain: self.clone(),
                inner: runnable,
            }),
            effective,
            mem,
        )
    }
}

/// Wraps a runnable so it runs holding the domain, releasing it on any
/// exit path.
struct DomainCall {
    domain: Arc<SyncDomain>,
    inner: Box<dyn Runnable>,
}

impl Runnable for DomainCall {
    fn run(&mut self) {
        let Some(ed) = ExecDomain::current() else {
            self.inner.on_exception(CoreError::Mem(MemError::BadInvOrder));
            return;
        };
        match self.domain.enter(&ed) {
            Ok(()) => {
                let result = catch_unwind(AssertUnwindSafe(|| self.inner.run()));
                if let Err(e) = self.domain.leave(&ed) {
                    tracing::error!(error = %e, "leave after domain call failed");
                }
                if let Err(payload) = result {
                    resume_unwind(payload);
                }
            }
            Err(e) => self.inner.on_exception(e),
        }
    }

    fn on_exception(&mut self, error: CoreError) {
        self.inner.on_exception(error);
    }

    fn on_crash(&mut self, signal: i32) {
        self.inner.on_crash(signal);
    }
}
