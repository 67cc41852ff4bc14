// SPDX-License-Identifier: GPL-2.0

//! The platform page primitive: anonymous, read/write, process-private page
//! runs from the host OS, and the host page size.
//!
//! This is the only place in the crate that talks to the kernel directly.
//! Isolating it here is what lets everything above assume a page is just a
//! `PS`-aligned run of bytes it owns until it calls [`unmap`].

use std::ffi::c_void;
use std::io;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::types::PageAddr;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Returns the host page size, querying it from the platform on first use
/// and memoizing the result for the lifetime of the process.
pub fn page_size() -> usize {
	let cached = PAGE_SIZE.load(Ordering::Relaxed);
	if cached != 0 {
		return cached;
	}

	// SAFETY: `sysconf` with `_SC_PAGESIZE` has no preconditions.
	let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
	if ps <= 0 {
		fatal(&format!("sysconf(_SC_PAGESIZE) failed: {}", io::Error::last_os_error()));
	}
	let ps = ps as usize;

	// Racing initializers all compute the same value from the same
	// syscall; the store is idempotent so we don't need compare-and-swap.
	PAGE_SIZE.store(ps, Ordering::Relaxed);
	ps
}

/// Maps `n` pages of anonymous, read/write, process-private memory.
///
/// Aborts the process with a diagnostic on failure; a mapping failure here
/// is never recoverable.
pub fn map(n: usize) -> PageAddr {
	debug_assert!(n >= 1);
	let len = n * page_size();

	// SAFETY: `MAP_ANON | MAP_PRIVATE` with a null fd and no backing file
	// is always a valid mmap request; the returned region is ours alone
	// until we `munmap` it.
	let ptr = unsafe {
		libc::mmap(
			std::ptr::null_mut(),
			len,
			libc::PROT_READ | libc::PROT_WRITE,
			libc::MAP_ANON | libc::MAP_PRIVATE,
			-1,
			0,
		)
	};

	if ptr == libc::MAP_FAILED {
		fatal(&format!("mmap({} pages) failed: {}", n, io::Error::last_os_error()));
	}

	log::trace!("mapped {} page(s) at {:p}", n, ptr);
	PageAddr(ptr as usize)
}

/// Unmaps the `n`-page run at `base`, previously returned by [`map`].
///
/// Aborts the process with a diagnostic on failure.
pub fn unmap(base: PageAddr, n: usize) {
	let len = n * page_size();

	// SAFETY: callers only ever pass a `(base, n)` pair that came from a
	// single prior `map` call and has not been unmapped since.
	let rc = unsafe { libc::munmap(base.as_ptr() as *mut c_void, len) };
	if rc != 0 {
		fatal(&format!(
			"munmap({}, {} pages) failed: {}",
			base,
			n,
			io::Error::last_os_error()
		));
	}

	log::trace!("unmapped {} page(s) at {}", n, base);
}

/// Writes a single-line diagnostic to stderr and terminates the process
/// with status 1. Used for every condition this crate treats as
/// unrecoverable: platform failure and allocator invariant violations alike.
pub(crate) fn fatal(message: &str) -> ! {
	if message.ends_with('\n') {
		eprint!("pagearena: fatal: {message}");
	} else {
		eprintln!("pagearena: fatal: {message}");
	}
	process::exit(1);
}
