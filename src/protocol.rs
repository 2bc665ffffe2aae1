use arbitrary_int::{u19, u3, u4, u9};
use bitbybit::{bitenum, bitfield};
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert;
use std::mem::size_of;
use thiserror::Error;

pub const UDPBD_PORT: u16 = 0xBDBD;

/// Frame-level decode failures (wire codec layer).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer too short: need at least {need} bytes, got {got}")]
    ShortBuffer { need: usize, got: usize },

    #[error("unknown command: {0}")]
    UnknownCommand(u8),

    #[error("unsupported block size: {0} (must be a power of two in 32..=512)")]
    UnsupportedBlockSize(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[bitenum(u5, exhaustive: false)]
pub enum Command {
    Info      = 0x00, // client -> server
    InfoReply = 0x01, // server -> client
    Read      = 0x02, // client -> server
    ReadRdma  = 0x03, // server -> client
    Write     = 0x04, // client -> server
    WriteRdma = 0x05, // client -> server
    WriteDone = 0x06, // server -> client
}

// 2 bytes - Must be a "(multiple of 4) + 2" for RDMA on the PS2 !
#[bitfield(u16)]
#[repr(packed)]
#[derive(Zeroable, Pod)]
pub struct Header {
    #[bits(0..=4, rw)]
    pub command: Option<Command>, // 0.. 31 - command

    #[bits(5..=7, rw)]
    pub command_id: u3, // 0..  8 - increment with every new command sequence

    #[bits(8..=15, rw)]
    pub command_pkt: u8, // 0..255 - 0=request, 1 or more are response packets
}

impl Header {
    pub fn build(command: Command, command_id: u3, command_pkt: u8) -> Self {
        Header::new_with_raw_value(0)
            .with_command(command)
            .with_command_id(command_id)
            .with_command_pkt(command_pkt)
    }

    /// Decode a header, rejecting any `cmd` outside the known command set.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let need = size_of::<Header>();
        if buf.len() < need {
            return Err(DecodeError::ShortBuffer { need, got: buf.len() });
        }
        let header = *bytemuck::from_bytes::<Header>(&buf[..need]);
        header
            .command()
            .map_err(|raw| DecodeError::UnknownCommand(raw.value()))?;
        Ok(header)
    }
}

// Info request. Can be a broadcast message to detect server on the network.
//
// Sequence of packets:
// - client: InfoRequest
// - server: InfoReply
#[repr(C)]
#[repr(packed)]
#[derive(Clone, Copy, Zeroable, Pod)]
pub struct InfoRequest {
    pub header: Header,
}

impl InfoRequest {
    pub fn sizeof() -> usize {
        size_of::<Self>()
    }

    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        let need = Self::sizeof();
        if buf.len() < need {
            return Err(DecodeError::ShortBuffer { need, got: buf.len() });
        }
        Ok(*bytemuck::from_bytes(&buf[..need]))
    }

    pub fn pack(&self) -> Vec<u8> {
        bytemuck::bytes_of(self).to_vec()
    }
}

#[repr(C)]
#[repr(packed)]
#[derive(Clone, Copy, Zeroable, Pod)]
pub struct InfoReply {
    pub header: Header,
    pub sector_size: u32,
    pub sector_count: u32, // u32 here, but u16 in rw request
}

impl InfoReply {
    pub fn sizeof() -> usize {
        size_of::<Self>()
    }

    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        let need = Self::sizeof();
        if buf.len() < need {
            return Err(DecodeError::ShortBuffer { need, got: buf.len() });
        }
        Ok(*bytemuck::from_bytes(&buf[..need]))
    }

    pub fn pack(&self) -> Vec<u8> {
        bytemuck::bytes_of(self).to_vec()
    }
}

// Read request, sequence of packets:
// - client: ReadRequest
// - server: RDMA (1 or more packets)
//
// Write request, sequence of packets:
// - client: WriteRequest
// - client: RDMA (1 or more packets)
// - server: WriteDone
#[repr(C)]
#[repr(packed)]
#[derive(Clone, Copy, Zeroable, Pod)]
pub struct ReadWriteRequest {
    pub header: Header,
    pub sector_nr: u32,
    pub sector_count: u16,
}

impl ReadWriteRequest {
    pub fn sizeof() -> usize {
        size_of::<Self>()
    }

    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        let need = Self::sizeof();
        if buf.len() < need {
            return Err(DecodeError::ShortBuffer { need, got: buf.len() });
        }
        Ok(*bytemuck::from_bytes(&buf[..need]))
    }

    pub fn pack(&self) -> Vec<u8> {
        bytemuck::bytes_of(self).to_vec()
    }
}

#[repr(C)]
#[repr(packed)]
#[derive(Clone, Copy, Zeroable, Pod)]
pub struct WriteReply {
    pub header: Header,
    pub result: i32,
}

impl WriteReply {
    pub fn sizeof() -> usize {
        size_of::<Self>()
    }

    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        let need = Self::sizeof();
        if buf.len() < need {
            return Err(DecodeError::ShortBuffer { need, got: buf.len() });
        }
        Ok(*bytemuck::from_bytes(&buf[..need]))
    }

    pub fn pack(&self) -> Vec<u8> {
        bytemuck::bytes_of(self).to_vec()
    }
}

#[bitfield(u32)]
#[repr(packed)]
#[derive(Zeroable, Pod)]
pub struct BlockType {
    #[bits(0..=3, rw)]
    pub block_shift: u4, // 0..7: blocks_size = 1 << (block_shift+2); min=0=4bytes, max=7=512bytes

    #[bits(4..=12, rw)]
    pub block_count: u9, // 1..366 blocks

    #[bits(13..=31, r)]
    spare: u19,
}

impl BlockType {
    /// Validates `block_shift` against the legal set {3,4,5,6,7} and
    /// computes `block_count * block_size` in 32-bit arithmetic, so an
    /// attacker-controlled `block_count` (up to 511) can't overflow a
    /// 16-bit product. This is the only place that rejects the decode-time
    /// cases §4.1 reserves for `UnsupportedBlockSize` — callers must run
    /// every incoming (wire-decoded) BlockType through this before trusting
    /// its size for anything.
    pub fn checked_blocks_size(&self) -> Result<u32, DecodeError> {
        let shift = self.block_shift().value();
        if !(3..=7).contains(&shift) {
            return Err(DecodeError::UnsupportedBlockSize(u16::from(shift)));
        }
        let block_size = 1u32 << (shift + 2);
        Ok(u32::from(self.block_count().value()) * block_size)
    }

    /// Construct a BlockType for a given desired block size (32..=512, power of two).
    pub fn for_block_size(block_size: u16, block_count: u9) -> Result<Self, DecodeError> {
        let shift = match block_size {
            32 => 3,
            64 => 4,
            128 => 5,
            256 => 6,
            512 => 7,
            other => return Err(DecodeError::UnsupportedBlockSize(other)),
        };
        Ok(BlockType::new_with_raw_value(0)
            .with_block_shift(u4::new(shift))
            .with_block_count(block_count))
    }
}

const_assert!(size_of::<Header>() == 2);
const_assert!(size_of::<InfoRequest>() == 2);
const_assert!(size_of::<InfoReply>() == 10);
const_assert!(size_of::<ReadWriteRequest>() == 8);
const_assert!(size_of::<WriteReply>() == 6);

const_assert!(size_of::<BlockType>() == 4);

/// Maximum payload for an RDMA packet depends on the used block size:
/// -   4 * 366 = 1464 bytes
/// -   8 * 183 = 1464 bytes
/// -  16 *  91 = 1456 bytes
/// -  32 *  45 = 1440 bytes
/// -  64 *  22 = 1408 bytes
/// - 128 *  11 = 1408 bytes <- default
/// - 256 *   5 = 1280 bytes
/// - 512 *   2 = 1024 bytes
pub const UDP_MAX_PAYLOAD: usize = 1472;
pub const RDMA_MAX_PAYLOAD: usize = UDP_MAX_PAYLOAD - size_of::<Header>() - size_of::<BlockType>();

/// Remote DMA (RDMA) packet
/// Used for transfering large blocks of data.
/// The heart of the protocol. Data must be a "(multiple of 4) + 2" for RDMA on the PS2 !
#[repr(C)]
#[repr(packed)]
#[derive(Clone, Copy, Zeroable, Pod)]
pub struct Rdma {
    pub header: Header,
    pub block_type: BlockType,
    pub data: [u8; RDMA_MAX_PAYLOAD],
}

const_assert!(size_of::<Rdma>() == UDP_MAX_PAYLOAD);

impl Rdma {
    const PREFIX: usize = size_of::<Header>() + size_of::<BlockType>();

    pub fn sizeof_prefix() -> usize {
        Self::PREFIX
    }

    /// Parse a datagram into an `Rdma`, returning it alongside the number
    /// of payload bytes actually present in `buf` (clamped to
    /// `RDMA_MAX_PAYLOAD`). That received length is independent of
    /// whatever `block_type` claims — §4.7 treats the BlockType-declared
    /// size and the datagram's actual length as two separate quantities
    /// that "should agree" but are not guaranteed to. Callers must clamp
    /// any BlockType-derived size against this received length (and
    /// against `checked_blocks_size`'s own validation) before indexing
    /// into `data`.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        if buf.len() < Self::PREFIX {
            return Err(DecodeError::ShortBuffer {
                need: Self::PREFIX,
                got: buf.len(),
            });
        }
        let header = Header::decode(&buf[..size_of::<Header>()])?;
        let block_type =
            *bytemuck::from_bytes::<BlockType>(&buf[size_of::<Header>()..Self::PREFIX]);

        let mut data = [0u8; RDMA_MAX_PAYLOAD];
        let payload = &buf[Self::PREFIX..];
        let received = payload.len().min(RDMA_MAX_PAYLOAD);
        data[..received].copy_from_slice(&payload[..received]);

        Ok((
            Rdma {
                header,
                block_type,
                data,
            },
            received,
        ))
    }

    /// Serialize only the meaningful prefix of `data` (`data_len` bytes) —
    /// never the whole fixed-size buffer, which would blow the MTU.
    pub fn pack_sized(&self, data_len: usize) -> Vec<u8> {
        let ser = bytemuck::bytes_of(self);
        ser[..Self::PREFIX + data_len].to_vec()
    }
}
