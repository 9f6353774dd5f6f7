// Weft
// Copyright (C) 2026 Weft Contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Guarded fiber stacks.
//!
//! Each fiber owns an anonymous mapping whose lowest page is `PROT_NONE`,
//! so a stack overflow traps deterministically instead of corrupting
//! adjacent memory.

#[cfg(not(unix))]
compile_error!("weft-core fiber stacks require a unix platform (mmap/mprotect)");

use std::io;
use std::ptr;

use crate::error::{RuntimeError, RuntimeResult};

/// A fiber stack: `len` mapped bytes at `base`, with the page at `base`
/// inaccessible and the usable region growing down from `top`.
#[derive(Debug)]
pub(crate) struct FiberStack {
    base: *mut u8,
    len: usize,
}

// SAFETY: the mapping is private to the owning task; only the worker
// currently executing the fiber touches the memory.
unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

impl FiberStack {
    /// Map a stack of at least `requested` usable bytes, rounded up to the
    /// page size, plus one guard page at the low end.
    pub fn new(requested: usize) -> RuntimeResult<Self> {
        let page = page_size();
        let usable = requested.div_ceil(page) * page;
        let len = usable + page;

        // SAFETY: fresh anonymous mapping; no existing memory is affected.
        unsafe {
            let base = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if base == libc::MAP_FAILED {
                return Err(RuntimeError::StackAllocation(io::Error::last_os_error().to_string()));
            }
            if libc::mprotect(base, page, libc::PROT_NONE) != 0 {
                let err = io::Error::last_os_error();
                libc::munmap(base, len);
                return Err(RuntimeError::StackAllocation(err.to_string()));
            }
            Ok(Self { base: base as *mut u8, len })
        }
    }

    /// Initial stack top: one past the highest mapped byte. Page alignment
    /// of the mapping makes this 16-byte aligned, as the context layer
    /// requires.
    pub fn top(&self) -> *mut u8 {
        // SAFETY: base..base+len is a single mapping; the one-past-the-end
        // pointer is valid to form.
        unsafe { self.base.add(self.len) }
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        // SAFETY: base/len describe the mapping created in `new`.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 { 4096 } else { sz as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_alignment_and_rounding() {
        let stack = FiberStack::new(10_000).expect("Failed to allocate stack");
        assert_eq!(stack.top() as usize % 16, 0);
        // Usable bytes round up to whole pages, plus the guard page.
        let page = page_size();
        assert_eq!(stack.len % page, 0);
        assert!(stack.len >= 10_000 + page);
    }

    #[test]
    fn test_stack_is_writable_below_top() {
        let stack = FiberStack::new(16 * 1024).expect("Failed to allocate stack");
        // SAFETY: writing inside the usable region of a fresh mapping.
        unsafe {
            let p = stack.top().sub(64);
            p.write(0xA5);
            assert_eq!(p.read(), 0xA5);
        }
    }
}
