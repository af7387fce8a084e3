//! Boot-time memory manager: a fixed-size intra-loader heap plus a physical
//! memory map, shared by BIOS and EFI loader stages before the kernel is
//! handed control.
//!
//! `no_std` in production; `#[cfg(test)]` pulls in `std` so the algorithmic
//! core can be driven with ordinary `cargo test` instead of only inside an
//! emulator.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod fatal;
pub mod heap;
pub mod log;
pub mod pmm;
pub mod sync;

pub use heap::Heap;
pub use pmm::{AddrTranslator, AllocFlags, MemoryRange, MemoryType, Pmm, PlatformProbe, PMM};
