use amigo_machine::{
    Allocator, DenseMemory, GuestMemory, GuestMemoryError, MemoryArena, SparseMemory,
    ARENA_GRANULE,
};
use proptest::prelude::*;

const RAM: u64 = 64 * 1024;
const CHUNK: usize = 4096;

#[derive(Debug, Clone)]
struct WriteOp {
    addr: u32,
    data: Vec<u8>,
}

fn write_op() -> impl Strategy<Value = WriteOp> {
    (0u32..RAM as u32, prop::collection::vec(any::<u8>(), 1..300)).prop_map(|(addr, data)| {
        // Keep the write inside RAM; out-of-range writes are checked separately.
        let max = RAM as usize - data.len();
        WriteOp {
            addr: addr.min(max as u32),
            data,
        }
    })
}

#[derive(Debug, Clone)]
enum ArenaOp {
    Alloc(u32),
    /// Frees the n-th live block (modulo the live count).
    Free(usize),
}

fn arena_op() -> impl Strategy<Value = ArenaOp> {
    prop_oneof![
        (0u32..600).prop_map(ArenaOp::Alloc),
        any::<usize>().prop_map(ArenaOp::Free),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn sparse_matches_dense(ops in prop::collection::vec(write_op(), 1..40)) {
        let dense = DenseMemory::new(RAM).unwrap();
        let sparse = SparseMemory::with_chunk_size(RAM, CHUNK).unwrap();

        for op in &ops {
            dense.write_from(op.addr, &op.data).unwrap();
            sparse.write_from(op.addr, &op.data).unwrap();
        }

        let mut a = vec![0u8; RAM as usize];
        let mut b = vec![0u8; RAM as usize];
        dense.read_into(0, &mut a).unwrap();
        sparse.read_into(0, &mut b).unwrap();
        prop_assert!(a == b);
        prop_assert!(sparse.allocated_chunks() <= RAM as usize / CHUNK);
    }

    #[test]
    fn accesses_past_the_end_fail(addr in (RAM as u32 - 8)..u32::MAX, len in 9usize..64) {
        let dense = DenseMemory::new(RAM).unwrap();
        let mut buf = vec![0u8; len];
        let is_out_of_range = matches!(
            dense.read_into(addr, &mut buf),
            Err(GuestMemoryError::OutOfRange { .. })
        );
        prop_assert!(is_out_of_range);
    }

    #[test]
    fn arena_blocks_never_overlap(ops in prop::collection::vec(arena_op(), 1..120)) {
        let base = 0x1000;
        let size = 0x4000;
        let arena = MemoryArena::new(base, size);
        let mut live: Vec<(u32, u32)> = Vec::new();

        for op in ops {
            match op {
                ArenaOp::Alloc(len) => {
                    if let Some(addr) = arena.allocate(len, "prop") {
                        prop_assert_eq!(addr % ARENA_GRANULE, 0);
                        prop_assert!(addr >= base);
                        prop_assert!(addr + len <= base + size);
                        for &(other, other_len) in &live {
                            let end = addr + len.max(1);
                            let other_end = other + other_len.max(1);
                            prop_assert!(end <= other || other_end <= addr);
                        }
                        prop_assert_eq!(arena.size_of(addr), Some(len));
                        live.push((addr, len));
                    }
                }
                ArenaOp::Free(n) => {
                    if !live.is_empty() {
                        let (addr, _) = live.swap_remove(n % live.len());
                        arena.free(addr);
                        prop_assert_eq!(arena.size_of(addr), None);
                    }
                }
            }
            prop_assert_eq!(arena.live_blocks(), live.len());
        }

        for (addr, _) in live.drain(..) {
            arena.free(addr);
        }
        // Everything coalesces back into one window.
        prop_assert_eq!(arena.free_bytes(), size);
        prop_assert_eq!(arena.allocate(size, "whole"), Some(base));
    }
}
