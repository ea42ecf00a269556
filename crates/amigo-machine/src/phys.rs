use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Largest guest address space: the guest CPU has 32 address bits.
pub const MAX_GUEST_SIZE: u64 = 1 << 32;

/// Errors returned by [`GuestMemory`] backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuestMemoryError {
    /// The requested address range is outside the guest memory size.
    #[error("guest memory access out of range: addr=0x{addr:08x} len={len} size=0x{size:x}")]
    OutOfRange { addr: u32, len: usize, size: u64 },
    /// The requested size does not fit the 32-bit guest address space.
    #[error("guest memory size {size} exceeds the 32-bit address space")]
    SizeTooLarge { size: u64 },
    /// The chosen chunk size is invalid (e.g. zero).
    #[error("invalid guest memory chunk size {chunk_size}")]
    InvalidChunkSize { chunk_size: usize },
    /// The allocator window must start at a non-zero, granule-aligned address.
    #[error("allocator window base 0x{base:08x} is null or not 8-byte aligned")]
    InvalidArenaBase { base: u32 },
}

pub type GuestMemoryResult<T> = Result<T, GuestMemoryError>;

/// Flat, byte-addressable, big-endian guest memory.
///
/// Accessors take `&self`: the address space is shared by every cooperative task thread and by
/// the CPU emulator, so backends provide their own interior locking. Only one guest task runs at a
/// time, so the locks are never contended in practice.
pub trait GuestMemory: Send + Sync {
    fn size(&self) -> u64;

    /// Reads bytes from guest memory into `dst`.
    fn read_into(&self, addr: u32, dst: &mut [u8]) -> GuestMemoryResult<()>;

    /// Writes bytes from `src` into guest memory.
    fn write_from(&self, addr: u32, src: &[u8]) -> GuestMemoryResult<()>;

    fn read_u8(&self, addr: u32) -> GuestMemoryResult<u8> {
        let mut buf = [0u8; 1];
        self.read_into(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, addr: u32) -> GuestMemoryResult<u16> {
        let mut buf = [0u8; 2];
        self.read_into(addr, &mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_u32(&self, addr: u32) -> GuestMemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.read_into(addr, &mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_i8(&self, addr: u32) -> GuestMemoryResult<i8> {
        Ok(self.read_u8(addr)? as i8)
    }

    fn read_i16(&self, addr: u32) -> GuestMemoryResult<i16> {
        Ok(self.read_u16(addr)? as i16)
    }

    fn read_i32(&self, addr: u32) -> GuestMemoryResult<i32> {
        Ok(self.read_u32(addr)? as i32)
    }

    fn write_u8(&self, addr: u32, value: u8) -> GuestMemoryResult<()> {
        self.write_from(addr, &[value])
    }

    fn write_u16(&self, addr: u32, value: u16) -> GuestMemoryResult<()> {
        self.write_from(addr, &value.to_be_bytes())
    }

    fn write_u32(&self, addr: u32, value: u32) -> GuestMemoryResult<()> {
        self.write_from(addr, &value.to_be_bytes())
    }

    /// Reads a NUL-terminated string. Bytes are decoded as Latin-1, the guest's native charset.
    ///
    /// A string that runs off the end of memory without a terminator is an out-of-range access.
    fn read_cstring(&self, addr: u32) -> GuestMemoryResult<String> {
        let mut out = String::new();
        let mut cur = addr;
        loop {
            let byte = self.read_u8(cur)?;
            if byte == 0 {
                return Ok(out);
            }
            out.push(char::from(byte));
            cur = cur.checked_add(1).ok_or(GuestMemoryError::OutOfRange {
                addr,
                len: out.len() + 1,
                size: self.size(),
            })?;
        }
    }

    /// Writes `s` followed by a NUL byte. Characters outside Latin-1 are stored as `?`.
    fn write_cstring(&self, addr: u32, s: &str) -> GuestMemoryResult<()> {
        let mut bytes: Vec<u8> = s
            .chars()
            .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
            .collect();
        bytes.push(0);
        self.write_from(addr, &bytes)
    }

    fn fill(&self, addr: u32, len: usize, value: u8) -> GuestMemoryResult<()> {
        self.write_from(addr, &vec![value; len])
    }
}

/// Number of bytes [`GuestMemory::write_cstring`] stores for `s`, terminator included.
pub fn cstring_len(s: &str) -> usize {
    s.chars().count() + 1
}

fn check_range(size: u64, addr: u32, len: usize) -> GuestMemoryResult<()> {
    let end = u64::from(addr)
        .checked_add(len as u64)
        .ok_or(GuestMemoryError::OutOfRange { addr, len, size })?;
    if end > size {
        return Err(GuestMemoryError::OutOfRange { addr, len, size });
    }
    Ok(())
}

fn check_size(size: u64) -> GuestMemoryResult<usize> {
    if size > MAX_GUEST_SIZE {
        return Err(GuestMemoryError::SizeTooLarge { size });
    }
    usize::try_from(size).map_err(|_| GuestMemoryError::SizeTooLarge { size })
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Contiguous guest memory backed by a single host allocation.
#[derive(Debug)]
pub struct DenseMemory {
    data: Mutex<Box<[u8]>>,
}

impl DenseMemory {
    pub fn new(size: u64) -> GuestMemoryResult<Self> {
        let len = check_size(size)?;
        Ok(Self {
            data: Mutex::new(vec![0u8; len].into_boxed_slice()),
        })
    }
}

impl GuestMemory for DenseMemory {
    fn size(&self) -> u64 {
        lock(&self.data).len() as u64
    }

    fn read_into(&self, addr: u32, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let data = lock(&self.data);
        check_range(data.len() as u64, addr, dst.len())?;
        let start = addr as usize;
        dst.copy_from_slice(&data[start..start + dst.len()]);
        Ok(())
    }

    fn write_from(&self, addr: u32, src: &[u8]) -> GuestMemoryResult<()> {
        let mut data = lock(&self.data);
        check_range(data.len() as u64, addr, src.len())?;
        let start = addr as usize;
        data[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }
}

/// Sparse guest memory backed by lazily-allocated fixed-size chunks.
///
/// Untouched chunks read as zero; a chunk is only allocated on first write.
#[derive(Debug)]
pub struct SparseMemory {
    size: u64,
    chunk_size: usize,
    chunks: Mutex<Vec<Option<Box<[u8]>>>>,
}

impl SparseMemory {
    pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

    pub fn new(size: u64) -> GuestMemoryResult<Self> {
        Self::with_chunk_size(size, Self::DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(size: u64, chunk_size: usize) -> GuestMemoryResult<Self> {
        if chunk_size == 0 {
            return Err(GuestMemoryError::InvalidChunkSize { chunk_size });
        }
        check_size(size)?;
        let chunk_size_u64 = chunk_size as u64;
        let chunk_count = usize::try_from(size.div_ceil(chunk_size_u64))
            .map_err(|_| GuestMemoryError::SizeTooLarge { size })?;
        Ok(Self {
            size,
            chunk_size,
            chunks: Mutex::new(vec![None; chunk_count]),
        })
    }

    /// Number of chunks that have been materialised by writes.
    pub fn allocated_chunks(&self) -> usize {
        lock(&self.chunks).iter().filter(|c| c.is_some()).count()
    }

    #[inline]
    fn split(&self, addr: u64) -> (usize, usize) {
        let chunk_size_u64 = self.chunk_size as u64;
        let chunk = (addr / chunk_size_u64) as usize;
        let offset = (addr % chunk_size_u64) as usize;
        (chunk, offset)
    }
}

impl GuestMemory for SparseMemory {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_into(&self, addr: u32, dst: &mut [u8]) -> GuestMemoryResult<()> {
        check_range(self.size, addr, dst.len())?;
        let chunks = lock(&self.chunks);
        let mut remaining = dst;
        let mut cur = u64::from(addr);

        while !remaining.is_empty() {
            let (chunk_idx, chunk_off) = self.split(cur);
            let take = (self.chunk_size - chunk_off).min(remaining.len());

            match chunks.get(chunk_idx).and_then(|c| c.as_ref()) {
                Some(chunk) => {
                    remaining[..take].copy_from_slice(&chunk[chunk_off..chunk_off + take])
                }
                None => remaining[..take].fill(0),
            }

            cur += take as u64;
            remaining = &mut remaining[take..];
        }

        Ok(())
    }

    fn write_from(&self, addr: u32, src: &[u8]) -> GuestMemoryResult<()> {
        check_range(self.size, addr, src.len())?;
        let mut chunks = lock(&self.chunks);
        let mut remaining = src;
        let mut cur = u64::from(addr);

        while !remaining.is_empty() {
            let (chunk_idx, chunk_off) = self.split(cur);
            let take = (self.chunk_size - chunk_off).min(remaining.len());

            // `check_range` guarantees the chunk index is in bounds.
            let chunk = chunks[chunk_idx]
                .get_or_insert_with(|| vec![0u8; self.chunk_size].into_boxed_slice());
            chunk[chunk_off..chunk_off + take].copy_from_slice(&remaining[..take]);

            cur += take as u64;
            remaining = &remaining[take..];
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_primitives_are_big_endian() {
        let mem = DenseMemory::new(64).unwrap();

        mem.write_u16(2, 0x1122).unwrap();
        mem.write_u32(4, 0x3344_5566).unwrap();

        let mut raw = [0u8; 6];
        mem.read_into(2, &mut raw).unwrap();
        assert_eq!(raw, [0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

        assert_eq!(mem.read_u16(2).unwrap(), 0x1122);
        assert_eq!(mem.read_u32(4).unwrap(), 0x3344_5566);
    }

    #[test]
    fn signed_reads_sign_extend() {
        let mem = DenseMemory::new(16).unwrap();
        mem.write_u8(0, 0xFB).unwrap();
        mem.write_u16(2, 0xFFFE).unwrap();
        mem.write_u32(4, 0xFFFF_FFFF).unwrap();

        assert_eq!(mem.read_i8(0).unwrap(), -5);
        assert_eq!(mem.read_i16(2).unwrap(), -2);
        assert_eq!(mem.read_i32(4).unwrap(), -1);
    }

    #[test]
    fn unaligned_access_is_allowed() {
        let mem = DenseMemory::new(16).unwrap();
        mem.write_u32(1, 0xdead_beef).unwrap();
        assert_eq!(mem.read_u32(1).unwrap(), 0xdead_beef);
        assert_eq!(mem.read_u8(1).unwrap(), 0xde);
    }

    #[test]
    fn cstring_round_trip_and_latin1() {
        let mem = DenseMemory::new(64).unwrap();
        mem.write_cstring(8, "port\u{e9}").unwrap();
        assert_eq!(mem.read_u8(12).unwrap(), 0xE9);
        assert_eq!(mem.read_u8(13).unwrap(), 0);
        assert_eq!(mem.read_cstring(8).unwrap(), "port\u{e9}");
        assert_eq!(cstring_len("port\u{e9}"), 6);

        mem.write_cstring(20, "\u{263a}").unwrap();
        assert_eq!(mem.read_cstring(20).unwrap(), "?");
    }

    #[test]
    fn unterminated_cstring_is_out_of_range() {
        let mem = DenseMemory::new(4).unwrap();
        mem.write_from(0, b"abcd").unwrap();
        assert!(matches!(
            mem.read_cstring(0),
            Err(GuestMemoryError::OutOfRange { .. })
        ));
    }

    #[test]
    fn sparse_unallocated_reads_return_zero() {
        let mem = SparseMemory::with_chunk_size(128, 16).unwrap();
        assert_eq!(mem.read_u8(0).unwrap(), 0);
        assert_eq!(mem.read_u32(4).unwrap(), 0);
        assert_eq!(mem.allocated_chunks(), 0, "reads must not allocate");
    }

    #[test]
    fn sparse_allocates_on_write() {
        let mem = SparseMemory::with_chunk_size(64, 16).unwrap();

        mem.write_u8(3, 0xaa).unwrap();
        assert_eq!(mem.allocated_chunks(), 1);
        assert_eq!(mem.read_u32(0).unwrap(), 0x0000_00aa);

        mem.write_u8(4, 0xbb).unwrap();
        assert_eq!(mem.allocated_chunks(), 1, "same chunk should not reallocate");
    }

    #[test]
    fn sparse_primitive_cross_chunk_boundary() {
        let mem = SparseMemory::with_chunk_size(64, 16).unwrap();

        // u32 at address 14 crosses chunk boundary (14..18).
        mem.write_u32(14, 0x1122_3344).unwrap();
        assert_eq!(mem.read_u32(14).unwrap(), 0x1122_3344);
        assert_eq!(mem.allocated_chunks(), 2);
    }

    #[test]
    fn out_of_range_returns_error_without_panicking() {
        let dense = DenseMemory::new(16).unwrap();
        assert!(matches!(
            dense.read_u32(14),
            Err(GuestMemoryError::OutOfRange { .. })
        ));
        assert!(matches!(
            dense.write_u16(15, 0),
            Err(GuestMemoryError::OutOfRange { .. })
        ));

        let sparse = SparseMemory::with_chunk_size(16, 8).unwrap();
        assert!(matches!(
            sparse.read_into(15, &mut [0u8; 2]),
            Err(GuestMemoryError::OutOfRange { .. })
        ));
        assert!(matches!(
            sparse.write_from(16, &[1u8]),
            Err(GuestMemoryError::OutOfRange { .. })
        ));

        // Overflowing address arithmetic must be handled without panicking.
        assert!(matches!(
            dense.read_into(u32::MAX, &mut [0u8; 2]),
            Err(GuestMemoryError::OutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_oversized_and_zero_chunk_configurations() {
        assert_eq!(
            DenseMemory::new(MAX_GUEST_SIZE + 1).unwrap_err(),
            GuestMemoryError::SizeTooLarge {
                size: MAX_GUEST_SIZE + 1
            }
        );
        assert_eq!(
            SparseMemory::with_chunk_size(64, 0).unwrap_err(),
            GuestMemoryError::InvalidChunkSize { chunk_size: 0 }
        );
    }
}
