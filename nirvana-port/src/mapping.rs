// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

//! Anonymous page-file-backed mapping handles.
//!
//! Every mapped block is a view of one of these handles. A handle can be
//! viewed by several blocks at once; that is the sharing primitive.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{MemError, Result};
use crate::BLOCK_SIZE;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static ANON_SHM_ID: AtomicU64 = AtomicU64::new(0);

/// An anonymous, page-file-backed mapping of exactly one block.
///
/// Identity matters: two blocks are views of the same underlying memory iff
/// their records hold handles with the same `id`.
#[derive(Debug)]
pub struct Mapping {
    fd: OwnedFd,
    id: u64,
}

impl Mapping {
    /// Creates a fresh block-sized mapping. Pages read as zero until
    /// written.
    pub fn new_block() -> Result<Mapping> {
        let fd = open_anon_fd()?;
        nix::unistd::ftruncate(&fd, BLOCK_SIZE as libc::off_t)
            .map_err(|e| MemError::from_os("ftruncate", e.into()))?;
        Ok(Mapping {
            fd,
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Writes `data` into the backing at `offset`, bypassing any view.
    pub fn write_at(&self, data: &[u8], offset: usize) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            let n = nix::sys::uio::pwrite(&self.fd, &data[done..], (offset + done) as libc::off_t)
                .map_err(|e| MemError::from_os("pwrite", e.into()))?;
            if n == 0 {
                return Err(MemError::Internal);
            }
            done += n;
        }
        Ok(())
    }

    /// Drops the backing store of a page range (subsequent reads through a
    /// direct view return zero). Linux only; elsewhere the content is
    /// merely left behind in the backing, which a later commit overwrites.
    pub fn punch_hole(&self, offset: usize, len: usize) -> Result<()> {
        #[cfg(target_os = "linux")]
        {
            let rc = unsafe {
                libc::fallocate(
                    self.fd.as_raw_fd(),
                    libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                    offset as libc::off_t,
                    len as libc::off_t,
                )
            };
            if rc != 0 {
                return Err(MemError::from_os(
                    "fallocate",
                    std::io::Error::last_os_error(),
                ));
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (offset, len);
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn open_anon_fd() -> Result<OwnedFd> {
    use std::os::fd::IntoRawFd;

    if let Ok(memfd) = memfd::MemfdOptions::default().create("nirvana-block") {
        let raw = memfd.into_raw_fd();
        // SAFETY: just unwrapped from an owning type.
        return Ok(unsafe { OwnedFd::from_raw_fd(raw) });
    }
    open_anon_fd_generic()
}

#[cfg(not(target_os = "linux"))]
fn open_anon_fd() -> Result<OwnedFd> {
    open_anon_fd_generic()
}

fn open_anon_fd_generic() -> Result<OwnedFd> {
    let path = format!(
        "/nirvana-block-{}-{}\0",
        std::process::id(),
        ANON_SHM_ID.fetch_add(1, Ordering::SeqCst)
    );
    // SAFETY: `path` is NUL-terminated; shm_open does not retain it.
    let fd = unsafe {
        libc::shm_open(
            path.as_ptr().cast(),
            libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
            0o600 as libc::mode_t,
        )
    };
    if fd < 0 {
        return Err(MemError::from_os(
            "shm_open",
            std::io::Error::last_os_error(),
        ));
    }
    // The name is only needed to mint the descriptor.
    // SAFETY: same NUL-terminated path.
    unsafe { libc::shm_unlink(path.as_ptr().cast()) };
    // SAFETY: fd was just created and is owned by no one else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
