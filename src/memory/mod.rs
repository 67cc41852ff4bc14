// SPDX-License-Identifier: GPL-2.0

//! Memory management subsystem: the page allocator and the bump arena
//! layered on top of it.

pub mod arena;
pub mod page_alloc;
