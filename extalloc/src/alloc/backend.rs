use std::fmt;

use crate::alloc::bitarray::BitArray;
use crate::alloc::runtree::RunTree;
use crate::alloc::search;
use crate::error::Result;

/// Storage strategies a bitmap can be built on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Packed array of bits, one bit per index.
    BitArray,
    /// Ordered map of runs of set bits.
    RunTree,
}

impl BackendKind {
    /// Allocates an all-zero payload able to hold `nbits` bits.
    pub(crate) fn allocate(self, nbits: u64) -> Result<Box<dyn BitmapBackend>> {
        match self {
            BackendKind::BitArray => Ok(Box::new(BitArray::new(nbits)?)),
            BackendKind::RunTree => Ok(Box::new(RunTree::new(nbits))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::BitArray => f.write_str("bitarray"),
            BackendKind::RunTree => f.write_str("runtree"),
        }
    }
}

/// The operator table every bitmap dispatches through.
///
/// Bit numbers are relative to the owning bitmap's `start`; the bitmap
/// validates every index and extent before calling in, so implementations may
/// assume their arguments lie within capacity.
pub trait BitmapBackend: fmt::Debug {
    fn kind(&self) -> BackendKind;

    /// Deep copy of the payload.
    fn duplicate(&self) -> Result<Box<dyn BitmapBackend>>;

    /// Changes the addressable end from `end` to `new_end` and the capacity to
    /// `new_real_end + 1` bits. Bits between the old and the new end read as
    /// zero afterwards. On error the payload must be left untouched.
    fn resize(&mut self, end: u64, new_end: u64, new_real_end: u64) -> Result<()>;

    /// Sets `bit`, returning its previous value.
    fn mark(&mut self, bit: u64) -> bool;

    /// Clears `bit`, returning its previous value.
    fn unmark(&mut self, bit: u64) -> bool;

    fn test(&self, bit: u64) -> bool;

    fn mark_extent(&mut self, bit: u64, count: u64);

    fn unmark_extent(&mut self, bit: u64, count: u64);

    /// Returns whether every bit of the extent was set, and clears the extent
    /// either way.
    fn test_clear_extent(&mut self, bit: u64, count: u64) -> bool;

    /// Loads `count` bits from `data`, LSB first.
    fn set_range(&mut self, bit: u64, count: u64, data: &[u8]);

    /// Stores `count` bits into `out`, LSB first. Bits of the last byte past
    /// `count` are written as zero.
    fn get_range(&self, bit: u64, count: u64, out: &mut [u8]);

    fn clear(&mut self);

    fn print_stats(&self, _description: &str) {}

    /// Number of set bits in `[bit, bit + count)`.
    fn count_set(&self, bit: u64, count: u64) -> u64 {
        search::generic_count_set(self, bit, count)
    }

    /// First clear bit in `[start, end]`.
    fn find_first_zero(&self, start: u64, end: u64) -> Option<u64> {
        search::generic_find_first_zero(self, start, end)
    }

    /// First set bit in `[start, end]`.
    fn find_first_set(&self, start: u64, end: u64) -> Option<u64> {
        search::generic_find_first_set(self, start, end)
    }
}

/// Sets bits `[from, to)` of a packed LSB-first buffer.
pub(crate) fn set_packed_bits(out: &mut [u8], from: u64, to: u64) {
    for i in from..to {
        out[(i / 8) as usize] |= 1 << (i % 8);
    }
}

/// Reads bit `i` of a packed LSB-first buffer.
pub(crate) fn packed_bit(data: &[u8], i: u64) -> bool {
    (data[(i / 8) as usize] >> (i % 8)) & 1 == 1
}

/// Bytes needed to carry `count` packed bits.
pub(crate) fn packed_len(count: u64) -> usize {
    ((count + 7) / 8) as usize
}
