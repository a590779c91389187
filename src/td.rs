//! Transfer descriptors.

/// One TD element may not cross a 64 KiB boundary of the data buffer.
pub const TRB_MAX_BUFF_SIZE: u32 = 1 << TRB_MAX_BUFF_SHIFT;
pub const TRB_MAX_BUFF_SHIFT: u32 = 16;

/// Opaque ticket for an in-flight TD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TdHandle(pub(crate) u64);

impl TdHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransferRequest {
    /// Bus address of the data buffer.
    pub buffer: u64,
    pub len: u32,
}

/// In-flight TD bookkeeping. Slots are identified by bus address so event
/// pointers compare directly.
#[derive(Debug, Clone, Copy)]
pub struct Td {
    pub handle: TdHandle,
    pub first_dma: u64,
    pub last_dma: u64,
    pub len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    /// Device sent less than the TD asked for; completion count is what
    /// actually moved.
    ShortPacket,
    Stall,
    Babble,
    TransactionError,
    TrbError,
    BufferOverrun,
    Cancelled,
    /// Controller died; the TD never ran to completion.
    Killed,
}

/// Number of ring slots a buffer needs, splitting at every 64 KiB boundary.
/// A zero-length transfer still takes one element.
pub fn trbs_needed(buffer: u64, len: u32) -> usize {
    if len == 0 {
        return 1;
    }
    let first_chunk = buffer >> TRB_MAX_BUFF_SHIFT;
    let last_chunk = (buffer + u64::from(len) - 1) >> TRB_MAX_BUFF_SHIFT;
    (last_chunk - first_chunk + 1) as usize
}

/// Byte count for the element starting at `addr`, limited by the next
/// 64 KiB boundary.
pub fn element_len(addr: u64, remaining: u32) -> u32 {
    let to_boundary = TRB_MAX_BUFF_SIZE - (addr as u32 & (TRB_MAX_BUFF_SIZE - 1));
    remaining.min(to_boundary)
}

/// TD-size field: remaining bytes in 1 KiB packets, saturated at the field
/// width.
pub fn td_size(remaining: u32) -> u8 {
    (remaining >> 10).min(31) as u8
}
