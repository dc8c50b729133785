// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use nirvana_port::MemError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Mem(#[from] MemError),

    /// The execution domain was removed from a wait queue before it ran.
    #[error("operation cancelled")]
    Cancelled,

    /// A runnable unwound; the payload is its panic message.
    #[error("runnable panicked: {0}")]
    Panicked(String),

    /// An error propagated to several waiters at once.
    #[error("{0}")]
    Shared(Arc<CoreError>),
}

pub type Result<T> = std::result::Result<T, CoreError>;
