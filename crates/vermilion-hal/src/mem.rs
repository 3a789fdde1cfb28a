use std::fmt;

/// A physically-contiguous region of bus-addressable memory.
///
/// `base` is the address the device sees; the CPU view is reached through
/// [`MemoryBus`]. Regions are plain handles — freeing goes back through the
/// allocator that produced them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemRegion {
    pub base: u32,
    pub size: u32,
}

impl MemRegion {
    /// End address (exclusive). Saturates rather than wrapping on malformed
    /// regions so range checks stay conservative.
    #[inline]
    pub fn end(&self) -> u32 {
        self.base.saturating_add(self.size)
    }

    #[inline]
    pub fn contains(&self, addr: u32, len: u32) -> bool {
        addr >= self.base && addr.saturating_add(len) <= self.end()
    }
}

/// Bus-addressable shared memory: the region the device DMAs from and into.
///
/// Addresses are device/bus addresses, not CPU pointers. Word accessors are
/// little-endian, matching the command-stream byte order.
pub trait MemoryBus: Send + Sync {
    fn read_physical(&self, addr: u32, buf: &mut [u8]);
    fn write_physical(&self, addr: u32, buf: &[u8]);

    fn read_u32(&self, addr: u32) -> u32 {
        let mut buf = [0u8; 4];
        self.read_physical(addr, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn write_u32(&self, addr: u32, value: u32) {
        self.write_physical(addr, &value.to_le_bytes());
    }

    fn write_u32_slice(&self, addr: u32, words: &[u32]) {
        let mut buf = Vec::with_capacity(words.len() * 4);
        for w in words {
            buf.extend_from_slice(&w.to_le_bytes());
        }
        self.write_physical(addr, &buf);
    }

    /// Fill `count` words starting at `addr` with `value`.
    fn fill_u32(&self, addr: u32, value: u32, count: u32) {
        for i in 0..count {
            self.write_u32(addr + i * 4, value);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// The backing pool cannot satisfy the request.
    OutOfMemory { size: u32 },
    /// Alignment is zero or not a power of two.
    BadAlignment { align: u32 },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory { size } => {
                write!(f, "contiguous allocation of {size} bytes failed")
            }
            AllocError::BadAlignment { align } => write!(f, "bad allocation alignment {align}"),
        }
    }
}

impl std::error::Error for AllocError {}

/// Allocator for physically-contiguous memory reachable by the device.
pub trait ContiguousAllocator: Send + Sync {
    fn alloc(&self, size: u32, align: u32) -> Result<MemRegion, AllocError>;
    fn free(&self, region: MemRegion);
}
