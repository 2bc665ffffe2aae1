//! Picks the RDMA block shift that minimizes packet count for a transfer.

use crate::utils::unsigned_rounded_up_div;

/// Largest RDMA payload usable per packet, independent of block size.
pub const RDMA_MAX_PAYLOAD: u32 = crate::protocol::RDMA_MAX_PAYLOAD as u32;

/// Choose the block shift (3, 5, 6 or 7) that sends `size_bytes` worth of
/// data in the fewest packets, preferring the largest block size among
/// ties. Falls back to shift 3 (32-byte blocks) when no larger shift
/// matches the minimum packet count.
pub fn select_block_shift(size_bytes: u32) -> u8 {
    let packets_at = |block_size: u32| {
        let blocks_per_packet = RDMA_MAX_PAYLOAD / block_size;
        let payload_per_packet = blocks_per_packet * block_size;
        unsigned_rounded_up_div(size_bytes, payload_per_packet)
    };

    let packets_min = packets_at(32);

    if packets_at(512) == packets_min {
        7
    } else if packets_at(256) == packets_min {
        6
    } else if packets_at(128) == packets_min {
        5
    } else {
        3
    }
}

/// Derived per-shift constants the server keeps alongside `block_shift`.
pub struct BlockShiftState {
    pub block_shift: u8,
    pub block_size: u16,
    pub blocks_per_packet: u16,
    pub blocks_per_sector: u16,
}

impl BlockShiftState {
    pub fn new(block_shift: u8, sector_size: u32) -> Self {
        let block_size: u16 = 1 << (block_shift + 2);
        let blocks_per_packet = (RDMA_MAX_PAYLOAD / u32::from(block_size)) as u16;
        let blocks_per_sector = (sector_size / u32::from(block_size)) as u16;
        BlockShiftState {
            block_shift,
            block_size,
            blocks_per_packet,
            blocks_per_sector,
        }
    }
}
