// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

use crate::error::CoreError;

/// An abstract unit of work, owned by whoever enqueues it.
///
/// `run` executes on an execution domain. An error or unwind that crosses
/// the domain boundary is dispatched to `on_exception`; hardware faults
/// reported by the host bridge go to `on_crash`.
pub trait Runnable: Send + 'static {
    fn run(&mut self);

    fn on_exception(&mut self, _error: CoreError) {}

    fn on_crash(&mut self, _signal: i32) {}
}

impl<F: FnMut() + Send + 'static> Runnable for F {
    fn run(&mut self) {
        self()
    }
}
