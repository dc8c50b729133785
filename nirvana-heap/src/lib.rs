// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

//! Heap layer of the Nirvana substrate.
//!
//! [`HeapDirectory`] manages one partition's units with a buddy bitmap;
//! [`Heap`] chains partitions of one allocation unit, falls back to the
//! port for oversized blocks, and supports zero-copy transfer of blocks
//! between heaps.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod config;
mod directory;
mod heap;
mod partition;

pub use directory::{DirectorySize, HeapDirectory, Payload, HEAP_LEVELS, MAX_BLOCK_UNITS};
pub use heap::Heap;
pub use nirvana_port::{AllocFlags, MemError, Result};
