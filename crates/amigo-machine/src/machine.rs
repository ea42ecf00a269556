use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::arena::{MemoryArena, ARENA_GRANULE};
use crate::phys::{DenseMemory, GuestMemory, GuestMemoryError, GuestMemoryResult, SparseMemory};
use crate::regs::RegisterFile;

/// Sizing of the emulated address space and the allocator window inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Guest RAM size in bytes.
    pub ram_size: u64,
    /// First address handed out by the allocator. Must be non-zero and 8-byte aligned.
    pub arena_base: u32,
    /// Size of the allocator window.
    pub arena_size: u32,
    /// Back RAM with lazily allocated chunks instead of one host allocation.
    pub sparse: bool,
    /// Chunk size used when `sparse` is set.
    pub chunk_size: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_size: 0x10_0000,
            arena_base: 0x1000,
            arena_size: 0xF_F000,
            sparse: false,
            chunk_size: SparseMemory::DEFAULT_CHUNK_SIZE,
        }
    }
}

impl MachineConfig {
    pub fn from_json_str(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// The external collaborators the exec layer consumes: memory, allocator and CPU registers.
#[derive(Clone)]
pub struct Machine {
    pub mem: Arc<dyn GuestMemory>,
    pub alloc: Arc<MemoryArena>,
    pub cpu: Arc<RegisterFile>,
}

impl Machine {
    pub fn new(config: &MachineConfig) -> GuestMemoryResult<Self> {
        if config.arena_base == 0 || config.arena_base % ARENA_GRANULE != 0 {
            return Err(GuestMemoryError::InvalidArenaBase {
                base: config.arena_base,
            });
        }
        let arena_end = u64::from(config.arena_base) + u64::from(config.arena_size);
        if arena_end > config.ram_size || arena_end > u64::from(u32::MAX) {
            return Err(GuestMemoryError::OutOfRange {
                addr: config.arena_base,
                len: config.arena_size as usize,
                size: config.ram_size,
            });
        }

        let mem: Arc<dyn GuestMemory> = if config.sparse {
            Arc::new(SparseMemory::with_chunk_size(
                config.ram_size,
                config.chunk_size,
            )?)
        } else {
            Arc::new(DenseMemory::new(config.ram_size)?)
        };

        Ok(Self {
            mem,
            alloc: Arc::new(MemoryArena::new(config.arena_base, config.arena_size)),
            cpu: Arc::new(RegisterFile::new()),
        })
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("ram_size", &self.mem.size())
            .field("arena", &self.alloc)
            .finish_non_exhaustive()
    }
}
