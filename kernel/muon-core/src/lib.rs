//! Freestanding foundation shared by every muon kernel crate.
//!
//! Everything here is pure logic or lock primitives: no paging, no
//! interrupts, no allocator. The crate compiles for the kernel target and
//! for the host, so the containing modules are unit-tested with `cargo test`.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod errno;
pub mod log;
pub mod sync;

pub use log::LogLevel;
