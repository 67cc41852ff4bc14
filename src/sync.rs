// SPDX-License-Identifier: GPL-2.0

//! Synchronization primitives used across the crate.
//!
//! The page allocator is guarded by exactly one process-wide mutex;
//! `std::sync::Mutex` is the right primitive for it, since `map`/`unmap`
//! may block briefly in the kernel and this crate has no reason to
//! busy-wait through a syscall the way a spinlock would.

pub use once_cell::sync::OnceCell;
pub use std::sync::{Mutex, MutexGuard};

/// Locks `mutex`, recovering the guard even if a prior holder panicked.
///
/// The allocator's own operations never panic while holding the lock, so a
/// poisoned mutex only happens if an unrelated panic unwound through here;
/// recovering keeps the allocator usable instead of poisoning every caller.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
