//! UMEM descriptor addresses.
//!
//! With `XDP_UMEM_UNALIGNED_CHUNK_FLAG` the kernel accepts buffers that start anywhere inside
//! the UMEM, so a descriptor carries two values in one `u64`: the buffer's base offset in the
//! low 48 bits and the byte offset of the packet data, relative to that base, above them.
//! Aligned (copy mode) addresses have no offset bits and round-trip unchanged.

/// Bit position of the intra-buffer offset (`XSK_UNALIGNED_BUF_OFFSET_SHIFT`).
pub const UNALIGNED_OFFSET_SHIFT: u32 = 48;

/// Mask of the base part (`XSK_UNALIGNED_BUF_ADDR_MASK`).
pub const UNALIGNED_ADDR_MASK: u64 = (1 << UNALIGNED_OFFSET_SHIFT) - 1;

/// Largest offset representable above the shift.
pub const MAX_OFFSET: u32 = (1 << (64 - UNALIGNED_OFFSET_SHIFT)) - 1;

/// A decoded UMEM descriptor address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct UmemAddress {
    /// Offset of the buffer start from the UMEM base.
    pub base: u64,
    /// Offset of the packet data from `base`.
    pub offset: u32,
}

impl UmemAddress {
    pub const fn new(base: u64, offset: u32) -> Self {
        UmemAddress { base, offset }
    }

    /// Splits a descriptor address into base and offset.
    #[inline]
    pub const fn from_wire(raw: u64) -> Self {
        UmemAddress {
            base: raw & UNALIGNED_ADDR_MASK,
            offset: (raw >> UNALIGNED_OFFSET_SHIFT) as u32,
        }
    }

    /// Packs into the descriptor format. `base` must fit in 48 bits and `offset` in 16.
    #[inline]
    pub const fn to_wire(self) -> u64 {
        debug_assert!(self.base <= UNALIGNED_ADDR_MASK);
        debug_assert!(self.offset <= MAX_OFFSET);
        (self.base & UNALIGNED_ADDR_MASK) | ((self.offset as u64) << UNALIGNED_OFFSET_SHIFT)
    }

    /// Byte position of the packet data from the UMEM base.
    #[inline]
    pub const fn data_position(self) -> u64 {
        self.base + self.offset as u64
    }
}

impl From<u64> for UmemAddress {
    fn from(raw: u64) -> Self {
        UmemAddress::from_wire(raw)
    }
}

impl From<UmemAddress> for u64 {
    fn from(addr: UmemAddress) -> Self {
        addr.to_wire()
    }
}
