// Copyright 2025-Present the Nirvana project contributors.
// SPDX-License-Identifier: Apache-2.0

//! Copy-on-write divergence probe.
//!
//! A shared block is a `MAP_PRIVATE` view of a mapping; the first write to
//! one of its pages makes the hardware replace the file page with an
//! anonymous private copy. `/proc/self/pagemap` exposes exactly that
//! transition: bit 61 ("file-page or shared-anon") is set while the page
//! still reads through the mapping and clear once it has privatized. The
//! PFN field is masked for unprivileged readers; the flag bits are not.

use std::fs::File;
use std::io;
use std::sync::OnceLock;

use crate::error::{MemError, Result};

const PM_ENTRY_BYTES: u64 = 8;
const PM_PRESENT: u64 = 1 << 63;
const PM_SWAPPED: u64 = 1 << 62;
const PM_FILE_SHARED: u64 = 1 << 61;

/// What the kernel currently backs a virtual page with.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageBacking {
    /// Never faulted in: still identical to the mapping.
    NotPresent,
    /// Reads through the file mapping: still identical to the mapping.
    Mapped,
    /// Privatized by copy-on-write (present or swapped anonymous page).
    Private,
}

impl PageBacking {
    /// The page has been disconnected from its mapping by a write.
    pub fn diverged(self) -> bool {
        self == PageBacking::Private
    }
}

fn pagemap() -> Result<&'static File> {
    static PAGEMAP: OnceLock<io::Result<File>> = OnceLock::new();
    PAGEMAP
        .get_or_init(|| File::open("/proc/self/pagemap"))
        .as_ref()
        .map_err(|e| {
            tracing::error!(error = %e, "pagemap unavailable, sharing lineage not observable");
            MemError::Internal
        })
}

/// Queries the backing of the page containing `addr`.
pub fn probe(addr: usize) -> Result<PageBacking> {
    use std::os::unix::fs::FileExt;

    let page = addr / crate::commit_unit();
    let mut buf = [0u8; PM_ENTRY_BYTES as usize];
    pagemap()?
        .read_exact_at(&mut buf, page as u64 * PM_ENTRY_BYTES)
        .map_err(|e| MemError::from_os("pagemap read", e))?;
    let entry = u64::from_le_bytes(buf);

    if entry & PM_FILE_SHARED != 0 {
        Ok(PageBacking::Mapped)
    } else if entry & (PM_PRESENT | PM_SWAPPED) != 0 {
        Ok(PageBacking::Private)
    } else {
        Ok(PageBacking::NotPresent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Mapping;
    use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
    use std::num::NonZeroUsize;

    #[test]
    fn cow_write_is_observable() {
        let mapping = Mapping::new_block().unwrap();
        let len = NonZeroUsize::new(crate::BLOCK_SIZE).unwrap();
        let view = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
                mapping.fd(),
                0,
            )
        }
        .unwrap();
        let base = view.as_ptr() as usize;

        assert_eq!(probe(base).unwrap(), PageBacking::NotPresent);

        // A read fault keeps the page connected to the mapping.
        let _ = unsafe { std::ptr::read_volatile(base as *const u8) };
        assert_eq!(probe(base).unwrap(), PageBacking::Mapped);

        // A write fault privatizes it.
        unsafe { std::ptr::write_volatile(base as *mut u8, 7) };
        assert_eq!(probe(base).unwrap(), PageBacking::Private);

        unsafe { munmap(view, len.get()).unwrap() };
    }
}
