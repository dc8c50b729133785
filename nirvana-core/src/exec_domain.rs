// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

//! Execution domains.
//!
//! A cooperatively scheduled unit of execution carried by one OS thread,
//! holding the dynamic scope of current memory context, current
//! synchronization context and current deadline. Between suspension
//! points it runs to completion; nothing else in the same synchronization
//! domain can observe intermediate state.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::deadline::Deadline;
use crate::error::{CoreError, Result};
use crate::mem_context::{self, MemContextRef};
use crate::runnable::Runnable;
use crate::sync_domain::{SyncContext, SyncDomain};
use crate::tls::TlsContext;
use nirvana_port::MemError;

/// Gates which substrate operations are legal, set around module
/// initialization and termination.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum RestrictedMode {
    Normal = 0,
    /// Class library initialization: no nested binding.
    ClassLibraryInit,
    /// Module termination: no nested binding, no deferred cleanup.
    ModuleTerminate,
    /// Deferred (asynchronous) context cleanup must not be scheduled.
    SuppressAsyncGc,
}

impl RestrictedMode {
    fn from_u8(v: u8) -> RestrictedMode {
        match v {
            1 => RestrictedMode::ClassLibraryInit,
            2 => RestrictedMode::ModuleTerminate,
            3 => RestrictedMode::SuppressAsyncGc,
            _ => RestrictedMode::Normal,
        }
    }

    /// Whether context teardown may be handed to a detached cleanup task.
    /// Once module termination or init is underway, the code such a task
    /// would run may be unloaded before it executes, so cleanup must stay
    /// on the releasing domain.
    pub(crate) fn allows_async_cleanup(self) -> bool {
        matches!(self, RestrictedMode::Normal)
    }
}

// Two-phase suspend states.
const RUNNING: u8 = 0;
/// The suspend slot is claimed; a wake registered now is not lost.
const PREPARED: u8 = 1;
const PARKED: u8 = 2;
const RESUMED: u8 = 3;

thread_local! {
    static CURRENT: RefCell<Option<Arc<ExecDomain>>> = const { RefCell::new(None) };
}

pub struct ExecDomain {
    deadline: AtomicU64,
    suspend: AtomicU8,
    thread: Mutex<Option<std::thread::Thread>>,
    mem_stack: Mutex<Vec<MemContextRef>>,
    /// Back-reference only: the domain owns its waiters and runner, the
    /// waiter must not keep the domain alive in turn.
    sync: Mutex<Weak<SyncDomain>>,
    restricted: AtomicU8,
    cancelled: AtomicBool,
    tls: Mutex<TlsContext>,
}

impl ExecDomain {
    /// Spawns a new execution domain on a dedicated OS thread and runs
    /// `runnable` inside it with the given deadline and memory context.
    /// An unwind out of `run` is caught at the domain boundary and
    /// dispatched to `on_exception`.
    pub fn spawn(
        runnable: Box<dyn Runnable>,
        deadline: Deadline,
        mem: MemContextRef,
    ) -> Result<Arc<ExecDomain>> {
        let ed = Arc::new(ExecDomain {
            deadline: AtomicU64::new(deadline.raw()),
            suspend: AtomicU8::new(RUNNING),
            thread: Mutex::new(None),
            mem_stack: Mutex::new(vec![mem]),
            sync: Mutex::new(Weak::new()),
            restricted: AtomicU8::new(RestrictedMode::Normal as u8),
            cancelled: AtomicBool::new(false),
            tls: Mutex::new(TlsContext::new()),
        });
        let inner = ed.clone();
        std::thread::Builder::new()
            .name("exec-domain".into())
            .spawn(move || {
                *inner.thread.lock() = Some(std::thread::current());
                CURRENT.with(|c| *c.borrow_mut() = Some(inner.clone()));
                let mut runnable = runnable;
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| runnable.run())) {
                    let message = panic_message(&payload);
                    tracing::warn!(%message, "runnable unwound the execution domain");
                    runnable.on_exception(CoreError::Panicked(message));
                }
                drop(runnable);
                inner.finish();
                CURRENT.with(|c| *c.borrow_mut() = None);
            })
            .map_err(|e| CoreError::Mem(MemError::Os { op: "spawn", source: e }))?;
        Ok(ed)
    }

    /// The execution domain carried by the calling thread.
    pub fn current() -> Option<Arc<ExecDomain>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    pub fn with_current<R>(f: impl FnOnce(&Arc<ExecDomain>) -> R) -> Option<R> {
        CURRENT.with(|c| c.borrow().as_ref().map(f))
    }

    pub fn deadline(&self) -> Deadline {
        Deadline::from_raw(self.deadline.load(Ordering::Acquire))
    }

    pub fn set_deadline(&self, d: Deadline) {
        self.deadline.store(d.raw(), Ordering::Release);
    }

    // ----- two-phase suspend --------------------------------------------

    /// Phase one: claims the suspend slot. After this, a `resume` from
    /// any thread is retained and [`ExecDomain::suspend_prepared`] will
    /// not sleep past it. Publish the wake source between the two phases.
    pub fn suspend_prepare(&self) -> Result<()> {
        self.suspend
            .compare_exchange(RUNNING, PREPARED, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CoreError::Mem(MemError::BadInvOrder))?;
        Ok(())
    }

    /// Phase two: parks the calling thread until resumed. Must run on the
    /// domain's own thread, after a successful
    /// [`ExecDomain::suspend_prepare`].
    pub fn suspend_prepared(&self) {
        loop {
            match self.suspend.load(Ordering::Acquire) {
                RESUMED => {
                    self.suspend.store(RUNNING, Ordering::Release);
                    return;
                }
                PREPARED => {
                    let _ = self.suspend.compare_exchange(
                        PREPARED,
                        PARKED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
                PARKED => std::thread::park(),
                _ => return,
            }
        }
    }

    /// Wakes a suspended (or suspend-prepared) domain.
    pub fn resume(&self) -> Result<()> {
        loop {
            let cur = self.suspend.load(Ordering::Acquire);
            match cur {
                PREPARED | PARKED => {
                    if self
                        .suspend
                        .compare_exchange(cur, RESUMED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        if cur == PARKED {
                            if let Some(t) = self.thread.lock().clone() {
                                t.unpark();
                            }
                        }
                        return Ok(());
                    }
                }
                _ => return Err(CoreError::Mem(MemError::BadInvOrder)),
            }
        }
    }

    // ----- dynamic scope ------------------------------------------------

    /// Current memory context: all allocation by the running runnable
    /// goes through its heap.
    pub fn mem_context(&self) -> Option<MemContextRef> {
        self.mem_stack.lock().last().cloned()
    }

    /// Temporarily switches the current memory context, e.g. to allocate
    /// out of a caller's heap while unmarshaling.
    pub fn mem_context_push(&self, ctx: MemContextRef) {
        self.mem_stack.lock().push(ctx);
    }

    pub fn mem_context_pop(&self) {
        let popped = self.mem_stack.lock().pop();
        if let Some(ctx) = popped {
            mem_context::release_from(ctx, self.restricted_mode());
        }
    }

    pub fn sync_context(&self) -> SyncContext {
        match self.sync.lock().upgrade() {
            Some(domain) => SyncContext::Domain(domain),
            None => SyncContext::Free,
        }
    }

    pub(crate) fn set_sync_context(&self, sc: SyncContext) {
        *self.sync.lock() = match sc {
            SyncContext::Free => Weak::new(),
            SyncContext::Domain(d) => Arc::downgrade(&d),
        };
    }

    pub fn restricted_mode(&self) -> RestrictedMode {
        RestrictedMode::from_u8(self.restricted.load(Ordering::Acquire))
    }

    pub fn set_restricted_mode(&self, mode: RestrictedMode) {
        self.restricted.store(mode as u8, Ordering::Release);
    }

    pub(crate) fn set_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn take_cancelled(&self) -> bool {
        self.cancelled.swap(false, Ordering::AcqRel)
    }

    /// Per-domain thread-local storage holder.
    pub fn tls(&self) -> parking_lot::MutexGuard<'_, TlsContext> {
        self.tls.lock()
    }

    /// Cooperative yield: pass through the current synchronization
    /// domain's queue so earlier deadlines get a turn.
    pub fn reschedule() -> Result<()> {
        let ed = ExecDomain::current().ok_or(CoreError::Mem(MemError::BadInvOrder))?;
        let sc = ed.sync_context();
        if let SyncContext::Domain(domain) = sc {
            domain.leave(&ed)?;
            domain.enter(&ed)?;
        }
        Ok(())
    }

    /// End of life on the domain's own thread: TLS entries are destructed
    /// in reverse allocation order, then the memory context stack
    /// unwinds, the heap going last.
    fn finish(&self) {
        self.tls.lock().clear();
        let mode = self.restricted_mode();
        loop {
            let popped = self.mem_stack.lock().pop();
            match popped {
                Some(ctx) => mem_context::release_from(ctx, mode),
                None => break,
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    eprintln!("DEBUG type_id={:?} str={} string={} expect_str={:?} expect_string={:?}", payload.type_id(), payload.is::<&str>(), payload.is::<String>(), std::any::TypeId::of::<&str>(), std::any::TypeId::of::<String>());
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_context::MemContext;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn resume_before_park_is_not_lost() {
        let (tx, rx) = mpsc::channel();
        let ed = ExecDomain::spawn(
            Box::new(move || {
                let me = ExecDomain::current().unwrap();
                me.suspend_prepare().unwrap();
                // The wake may land here, between the two phases.
                std::thread::sleep(Duration::from_millis(50));
                me.suspend_prepared();
                tx.send(()).unwrap();
            }),
            Deadline::INFINITE,
            MemContext::create(),
        )
        .unwrap();

        // Resume as soon as the slot is claimed.
        loop {
            match ed.resume() {
                Ok(()) => break,
                Err(_) => std::thread::yield_now(),
            }
        }
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn double_prepare_is_an_order_violation() {
        let (tx, rx) = mpsc::channel();
        let ed = ExecDomain::spawn(
            Box::new(move || {
                let me = ExecDomain::current().unwrap();
                me.suspend_prepare().unwrap();
                tx.send(me.suspend_prepare().is_err()).unwrap();
                me.suspend_prepared();
            }),
            Deadline::INFINITE,
            MemContext::create(),
        )
        .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        loop {
            if ed.resume().is_ok() {
                break;
            }
            std::thread::yield_now();
        }
    }

    #[test]
    fn panic_dispatches_to_on_exception() {
        struct Failing(mpsc::Sender<String>);
        impl Runnable for Failing {
            fn run(&mut self) {
                panic!("boom");
            }
            fn on_exception(&mut self, error: CoreError) {
                self.0.send(error.to_string()).unwrap();
            }
        }
        let (tx, rx) = mpsc::channel();
        ExecDomain::spawn(
            Box::new(Failing(tx)),
            Deadline::INFINITE,
            MemContext::create(),
        )
        .unwrap();
        let msg = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(msg.contains("boom"), "{msg}");
    }
}

#[cfg(test)]
mod bisect5 {
    use super::*;
    use crate::mem_context::MemContext;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8};
    use std::sync::{Arc, Weak};
    use parking_lot::Mutex;

    #[test]
    fn bisect5() {
        struct Failing;
        impl Runnable for Failing {
            fn run(&mut self) { panic!("boom"); }
        }
        let mem = MemContext::create();
        let runnable: Box<dyn Runnable> = Box::new(Failing);
        let ed = Arc::new(ExecDomain {
            deadline: AtomicU64::new(Deadline::INFINITE.raw()),
            suspend: AtomicU8::new(RUNNING),
            thread: Mutex::new(None),
            mem_stack: Mutex::new(vec![mem]),
            sync: Mutex::new(Weak::new()),
            restricted: AtomicU8::new(0),
            cancelled: AtomicBool::new(false),
            tls: Mutex::new(TlsContext::new()),
        });
        let inner = ed.clone();
        std::thread::Builder::new().name("exec-domain".into()).spawn(move || {
            *inner.thread.lock() = Some(std::thread::current());
            CURRENT.with(|c| *c.borrow_mut() = Some(inner.clone()));
            let mut runnable = runnable;
            let r = catch_unwind(AssertUnwindSafe(|| runnable.run()));
            if let Err(payload) = r {
                eprintln!("BISECT5 str={} string={}", payload.downcast_ref::<&str>().is_some(), payload.downcast_ref::<String>().is_some());
            }
            drop(runnable);
            inner.finish();
            CURRENT.with(|c| *c.borrow_mut() = None);
        }).unwrap().join().unwrap();
    }
}
