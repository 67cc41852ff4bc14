// SPDX-License-Identifier: GPL-2.0

//! A page-granular allocator and bump arena, built directly on the host
//! operating system's anonymous page mapping primitive.
//!
//! Two cooperating layers live under [`memory`]:
//!
//! - `palloc`/`pfree`: hands out contiguous runs of OS pages, with a
//!   bounded cache of recently freed runs and self-hosted bookkeeping.
//! - `Arena`: a growable chain of pages obtained from the page allocator,
//!   for fast sequential allocation and bulk release of a whole generation.
//!
//! This crate replaces both the general-purpose allocator for bulk,
//! page-granular needs, and the bump/arena pattern for short-lived object
//! clusters. It is meant to be linked into larger native programs, not used
//! standalone.

pub mod error;
pub mod memory;
mod platform;
pub mod sync;
pub mod types;

pub use error::{Error, Result};
pub use memory::arena::{
	arena_alloc, arena_create, arena_create_ext, arena_free, default_arena_growth,
	default_arena_initial, Arena,
};
pub use memory::page_alloc::{page_size, palloc, pfree, FREE_CAP, STATIC_SLOT_COUNT};
