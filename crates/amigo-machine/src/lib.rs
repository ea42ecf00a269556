//! Host-side stand-ins for the collaborators the exec personality layer runs on top of.
//!
//! - [`GuestMemory`]: the flat, big-endian guest address space ([`DenseMemory`],
//!   [`SparseMemory`]).
//! - [`Allocator`]: hands out guest address ranges ([`MemoryArena`]).
//! - [`Cpu`]: register access for register-resident values ([`RegisterFile`]).
//!
//! [`Machine`] bundles one of each, built from a [`MachineConfig`].

#![forbid(unsafe_code)]

use std::fmt;

mod arena;
mod machine;
mod phys;
mod regs;

pub use arena::{Allocator, MemoryArena, ARENA_GRANULE};
pub use machine::{Machine, MachineConfig};
pub use phys::{
    cstring_len, DenseMemory, GuestMemory, GuestMemoryError, GuestMemoryResult, SparseMemory,
    MAX_GUEST_SIZE,
};
pub use regs::{Cpu, Reg, RegisterFile};

/// Formats a guest address the way trace output shows them (`0x0001f2a8`).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Hex(pub u32);

impl fmt::Display for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl fmt::Debug for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
