// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

//! Compile-time heap parameters.

use crate::directory::DirectorySize;

/// Smallest allocation unit a heap may be created with.
///
/// Alignment overhead averages half a unit per allocated block, and the
/// bitmap costs two bits per unit of heap, so the optimum depends on the
/// size distribution of live blocks. Sixteen bytes suits object-heavy
/// workloads.
pub const HEAP_UNIT_MIN: usize = 16;

/// Default allocation unit for user heaps.
pub const HEAP_UNIT_DEFAULT: usize = 16;

/// Largest allocation unit a heap may be created with.
pub const HEAP_UNIT_MAX: usize = 4096;

/// Directory size for heap partitions.
///
/// Must be a multiple of the protection-domain granularity. 64 KiB keeps
/// a dedicated free-block counter per level with the populous levels
/// split, which bounds every bitmap search to 64 Ki bits.
pub const HEAP_DIRECTORY_SIZE: DirectorySize = DirectorySize::Large;
