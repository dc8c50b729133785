// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

//! Wait list for asynchronous operations.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CoreError, Result};
use crate::exec_domain::ExecDomain;
use nirvana_port::MemError;

struct Inner {
    signalled: bool,
    error: Option<Arc<CoreError>>,
    waiters: Vec<Arc<ExecDomain>>,
}

/// An event execution domains can wait on. Signalling resumes every
/// waiter, optionally delivering an error to all of them.
pub struct Event {
    inner: Mutex<Inner>,
}

impl Event {
    pub fn new(signalled: bool) -> Event {
        Event {
            inner: Mutex::new(Inner {
                signalled,
                error: None,
                waiters: Vec::new(),
            }),
        }
    }

    pub fn signalled(&self) -> bool {
        self.inner.lock().signalled
    }

    /// Suspends the current execution domain until the event is
    /// signalled. Returns the signalled error, if one was delivered.
    pub fn wait(&self) -> Result<()> {
        let ed = ExecDomain::current().ok_or(CoreError::Mem(MemError::BadInvOrder))?;
        {
            let mut inner = self.inner.lock();
            if inner.signalled {
                return Self::outcome(&inner);
            }
            ed.suspend_prepare()?;
            inner.waiters.push(ed.clone());
        }
        ed.suspend_prepared();
        Self::outcome(&self.inner.lock())
    }

    fn outcome(inner: &Inner) -> Result<()> {
        match &inner.error {
            Some(e) => Err(CoreError::Shared(e.clone())),
            None => Ok(()),
        }
    }

    /// Signals the event and resumes all waiting execution domains.
    pub fn signal(&self) {
        self.finish(None);
    }

    /// Signals the event delivering `error` to every waiter.
    pub fn signal_error(&self, error: CoreError) {
        self.finish(Some(Arc::new(error)));
    }

    fn finish(&self, error: Option<Arc<CoreError>>) {
        let waiters = {
            let mut inner = self.inner.lock();
            debug_assert!(!inner.signalled);
            inner.signalled = true;
            inner.error = error;
            std::mem::take(&mut inner.waiters)
        };
        for ed in waiters {
            if let Err(e) = ed.resume() {
                tracing::error!(error = %e, "event waiter did not resume");
            }
        }
    }

    /// Returns the event to the non-signalled state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.signalled = false;
        inner.error = None;
    }
}

impl Default for Event {
    fn default() -> Event {
        Event::new(false)
    }
}
