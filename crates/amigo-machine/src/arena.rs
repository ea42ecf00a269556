//! Guest address-range allocator.
//!
//! The exec layer never manages guest memory itself; it asks an [`Allocator`] for address ranges
//! and hands them back when a structure is released. [`MemoryArena`] is the host-side
//! implementation used by [`crate::Machine`]: a first-fit allocator over one contiguous window of
//! guest memory.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::Hex;

/// All blocks are rounded up to and aligned on this many bytes.
pub const ARENA_GRANULE: u32 = 8;

/// Hands out guest address ranges.
///
/// `tag` is a debugging label only; it never changes allocation behaviour.
pub trait Allocator: Send + Sync {
    /// Reserves `size` bytes and returns the guest address, or `None` when exhausted.
    fn allocate(&self, size: u32, tag: &str) -> Option<u32>;

    /// Releases a block previously returned by [`Allocator::allocate`].
    fn free(&self, addr: u32);

    /// Requested size of the live block starting at `addr`.
    fn size_of(&self, addr: u32) -> Option<u32>;

    /// Records the guest address of the pointer field that owns the live block at `addr`, or
    /// clears it for `None`. Returns `false` if no live block starts at `addr`.
    fn set_owner(&self, addr: u32, owner: Option<u32>) -> bool;

    /// Owner recorded by [`Allocator::set_owner`] for the live block at `addr`.
    fn owner_of(&self, addr: u32) -> Option<u32>;
}

#[derive(Debug, Clone)]
struct Block {
    /// Rounded size actually reserved.
    reserved: u32,
    requested: u32,
    tag: String,
    owner: Option<u32>,
}

#[derive(Debug, Default)]
struct ArenaState {
    /// Free ranges keyed by start address, value is the length.
    free: BTreeMap<u32, u32>,
    live: BTreeMap<u32, Block>,
}

/// First-fit allocator over `[base, base + size)`.
#[derive(Debug)]
pub struct MemoryArena {
    base: u32,
    size: u32,
    state: Mutex<ArenaState>,
}

impl MemoryArena {
    /// Creates an arena. `base` must be non-zero and granule aligned so that address 0 stays the
    /// null pointer.
    pub fn new(base: u32, size: u32) -> Self {
        assert!(base != 0, "arena must not start at the null address");
        assert_eq!(base % ARENA_GRANULE, 0, "arena base must be granule aligned");
        assert!(
            base.checked_add(size).is_some(),
            "arena must fit the 32-bit address space"
        );

        let size = size - size % ARENA_GRANULE;
        let mut state = ArenaState::default();
        if size != 0 {
            state.free.insert(base, size);
        }
        Self {
            base,
            size,
            state: Mutex::new(state),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn live_blocks(&self) -> usize {
        self.lock().live.len()
    }

    pub fn free_bytes(&self) -> u32 {
        self.lock().free.values().sum()
    }

    /// Debug tag of the live block at `addr`.
    pub fn tag_of(&self, addr: u32) -> Option<String> {
        self.lock().live.get(&addr).map(|b| b.tag.clone())
    }

    fn lock(&self) -> MutexGuard<'_, ArenaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Allocator for MemoryArena {
    fn allocate(&self, size: u32, tag: &str) -> Option<u32> {
        let reserved = size.max(1).checked_next_multiple_of(ARENA_GRANULE)?;
        let mut state = self.lock();

        let (start, len) = state
            .free
            .iter()
            .find(|(_, len)| **len >= reserved)
            .map(|(start, len)| (*start, *len))?;

        state.free.remove(&start);
        if len > reserved {
            state.free.insert(start + reserved, len - reserved);
        }
        state.live.insert(
            start,
            Block {
                reserved,
                requested: size,
                tag: tag.to_owned(),
                owner: None,
            },
        );

        debug!(addr = %Hex(start), size, tag, "arena alloc");
        Some(start)
    }

    fn free(&self, addr: u32) {
        let mut state = self.lock();
        let Some(block) = state.live.remove(&addr) else {
            warn!(addr = %Hex(addr), "arena free of unknown block ignored");
            return;
        };
        debug!(
            addr = %Hex(addr),
            size = block.requested,
            tag = %block.tag,
            "arena free"
        );

        let mut start = addr;
        let mut len = block.reserved;

        let next = state
            .free
            .range(start + len..)
            .next()
            .map(|(s, l)| (*s, *l));
        if let Some((next_start, next_len)) = next {
            if next_start == start + len {
                state.free.remove(&next_start);
                len += next_len;
            }
        }

        let prev = state.free.range(..start).next_back().map(|(s, l)| (*s, *l));
        if let Some((prev_start, prev_len)) = prev {
            if prev_start + prev_len == start {
                state.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }

        state.free.insert(start, len);
    }

    fn size_of(&self, addr: u32) -> Option<u32> {
        self.lock().live.get(&addr).map(|b| b.requested)
    }

    fn set_owner(&self, addr: u32, owner: Option<u32>) -> bool {
        let mut state = self.lock();
        let Some(block) = state.live.get_mut(&addr) else {
            warn!(addr = %Hex(addr), "owner set on unknown block");
            return false;
        };
        block.owner = owner;
        true
    }

    fn owner_of(&self, addr: u32) -> Option<u32> {
        self.lock().live.get(&addr).and_then(|b| b.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_never_null() {
        let arena = MemoryArena::new(0x1000, 0x100);
        let a = arena.allocate(3, "a").unwrap();
        let b = arena.allocate(14, "b").unwrap();

        assert_eq!(a, 0x1000);
        assert_eq!(b, 0x1008);
        assert_eq!(arena.size_of(b), Some(14));
        assert_eq!(arena.tag_of(a).as_deref(), Some("a"));
    }

    #[test]
    fn exhaustion_returns_none() {
        let arena = MemoryArena::new(0x1000, 0x20);
        assert!(arena.allocate(0x20, "all").is_some());
        assert_eq!(arena.allocate(1, "more"), None);
    }

    #[test]
    fn free_coalesces_neighbours() {
        let arena = MemoryArena::new(0x1000, 0x30);
        let a = arena.allocate(0x10, "a").unwrap();
        let b = arena.allocate(0x10, "b").unwrap();
        let c = arena.allocate(0x10, "c").unwrap();

        arena.free(a);
        arena.free(c);
        arena.free(b);

        assert_eq!(arena.live_blocks(), 0);
        assert_eq!(arena.free_bytes(), 0x30);
        // One coalesced range is able to satisfy a full-size request again.
        assert_eq!(arena.allocate(0x30, "all"), Some(0x1000));
    }

    #[test]
    fn unknown_free_is_ignored() {
        let arena = MemoryArena::new(0x1000, 0x40);
        let a = arena.allocate(8, "a").unwrap();
        arena.free(a + 4);
        assert_eq!(arena.live_blocks(), 1);
        arena.free(a);
        arena.free(a);
        assert_eq!(arena.free_bytes(), 0x40);
    }

    #[test]
    fn owner_is_dropped_with_the_block() {
        let arena = MemoryArena::new(0x1000, 0x40);
        let a = arena.allocate(8, "a").unwrap();
        assert_eq!(arena.owner_of(a), None);
        assert!(arena.set_owner(a, Some(0x2004)));
        assert_eq!(arena.owner_of(a), Some(0x2004));
        assert!(!arena.set_owner(a + 8, Some(0x2004)));

        arena.free(a);
        assert_eq!(arena.owner_of(a), None);
        let b = arena.allocate(8, "b").unwrap();
        assert_eq!(b, a);
        assert_eq!(arena.owner_of(b), None);
    }
}
