// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

//! Concurrency core of the Nirvana substrate.
//!
//! Execution domains are cooperatively scheduled units of work carried by
//! OS threads; synchronization domains serialize them over the heaps they
//! guard, in deadline order; memory contexts own the per-execution
//! resources. One execution domain is live per synchronization domain at
//! any instant; across domains only deadlines impose order.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

mod deadline;
mod error;
mod event;
mod exec_domain;
mod mem_context;
mod priority_queue;
mod runnable;
mod sync_domain;
pub mod tls;

pub use deadline::Deadline;
pub use error::{CoreError, Result};
pub use event::Event;
pub use exec_domain::{ExecDomain, RestrictedMode};
pub use mem_context::{release as mem_context_release, FdTable, MemContext, MemContextRef, RuntimeProxy};
pub use priority_queue::{ItemHandle, PriorityQueue};
pub use runnable::Runnable;
pub use sync_domain::{SyncContext, SyncDomain};
