// SPDX-License-Identifier: GPL-2.0

//! Error handling types and utilities.
//!
//! Most failure modes in this crate are fatal by contract (see
//! [`crate::platform`]): a platform `mmap`/`munmap` failure or a broken
//! allocator invariant aborts the process rather than returning an
//! `Error`. The only *recoverable* condition is an invalid argument to
//! [`crate::palloc`], which is both returned as `None` and recorded here so
//! callers can inspect it after the fact, the way `errno` works for libc
//! calls.

use std::cell::Cell;
use std::fmt;

/// Recoverable error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	/// An argument failed a precondition (e.g. `palloc(0)`).
	InvalidArgument,
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::InvalidArgument => write!(f, "invalid argument"),
		}
	}
}

impl std::error::Error for Error {}

/// Crate result type.
pub type Result<T> = core::result::Result<T, Error>;

thread_local! {
	static LAST_ERROR: Cell<Option<Error>> = Cell::new(None);
}

pub(crate) fn set_last_error(err: Error) {
	LAST_ERROR.with(|cell| cell.set(Some(err)));
}

/// Returns the most recent recoverable error observed by this thread, if
/// any. Mirrors `errno`: it is set on failure and left untouched on success.
pub fn last_error() -> Option<Error> {
	LAST_ERROR.with(|cell| cell.get())
}
