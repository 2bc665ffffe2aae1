use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    time::Duration,
};

use anyhow::Context;
use arbitrary_int::{u4, u9};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    blockdevice::{BlockDevice, Counters},
    protocol::{
        BlockType, Command, DecodeError, Header, InfoReply, InfoRequest, ReadWriteRequest, Rdma,
        RDMA_MAX_PAYLOAD, UDPBD_PORT, UDP_MAX_PAYLOAD, WriteReply,
    },
    shift::{select_block_shift, BlockShiftState},
};

/// Initial block shift at server start (5 -> 128-byte blocks), per §4.8.
const INITIAL_BLOCK_SHIFT: u8 = 5;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket closed")]
    SocketClosed,

    #[error("receive timed out")]
    Timeout,
}

pub struct Server {
    block_device: BlockDevice,
    socket: UdpSocket,
    shift: BlockShiftState,
    write_size_left: usize,
    write_rdma_valid: bool,
    recv_buf: [u8; UDP_MAX_PAYLOAD],
}

impl Server {
    pub fn new(block_device: BlockDevice, port: u16) -> anyhow::Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr).context("failed to create UDP socket")?;
        socket
            .set_broadcast(true)
            .context("failed to enable broadcast on UDP socket")?;

        let shift = BlockShiftState::new(INITIAL_BLOCK_SHIFT, block_device.sector_size());

        Ok(Server {
            block_device,
            socket,
            shift,
            write_size_left: 0,
            write_rdma_valid: false,
            recv_buf: [0u8; UDP_MAX_PAYLOAD],
        })
    }

    /// Counters for a background status reporter; cheap to clone, safe to
    /// read from another thread without synchronization (§5).
    pub fn counters(&self) -> Counters {
        self.block_device.counters()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Runs the receive -> handle -> send loop until the device becomes
    /// unavailable or the socket errors out. `recv_timeout` bounds each
    /// blocking receive so availability can be re-checked periodically.
    pub fn run(&mut self, recv_timeout: Duration) {
        info!(port = UDPBD_PORT, "udpbd server running");

        if let Err(err) = self.socket.set_read_timeout(Some(recv_timeout)) {
            error!(%err, "failed to set receive timeout, exiting");
            return;
        }

        loop {
            if !self.block_device.available() {
                error!("block device is no longer available, stopping server");
                break;
            }

            match self.recv_and_dispatch() {
                Ok(()) => {}
                Err(TransportError::Timeout) => continue,
                Err(TransportError::SocketClosed) => {
                    error!("socket closed, stopping server");
                    break;
                }
            }
        }

        self.block_device.close();
        info!("udpbd server stopped");
    }

    /// Receives exactly one datagram and dispatches it. Exposed separately
    /// from `run` so tests can drive single request/response cycles.
    pub fn recv_and_dispatch(&mut self) -> Result<(), TransportError> {
        let (n, addr) = match self.socket.recv_from(&mut self.recv_buf) {
            Ok(v) => v,
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(TransportError::Timeout);
            }
            Err(err) => {
                error!(%err, "socket receive failed");
                return Err(TransportError::SocketClosed);
            }
        };
        // Clear the unused tail so a short datagram never resurrects
        // bytes left over from a previous, longer one.
        self.recv_buf[n..].fill(0);

        let buf = self.recv_buf;
        self.dispatch(&buf[..n], addr);
        Ok(())
    }

    fn dispatch(&mut self, buf: &[u8], addr: SocketAddr) {
        let header = match Header::decode(buf) {
            Ok(h) => h,
            Err(DecodeError::UnknownCommand(raw)) => {
                warn!(cmd = raw, %addr, "dropping datagram with unknown command");
                return;
            }
            Err(err) => {
                warn!(%err, %addr, "dropping undecodable datagram");
                return;
            }
        };

        // Header::decode already rejected unknown tags; unwrap is safe.
        match header.command().unwrap() {
            Command::Info => self.handle_info(buf, addr),
            Command::Read => self.handle_read(buf, addr),
            Command::Write => self.handle_write(buf),
            Command::WriteRdma => self.handle_write_rdma(buf, addr),
            other => {
                warn!(cmd = ?other, %addr, "dropping unexpected command");
            }
        }
    }

    fn handle_info(&mut self, buf: &[u8], addr: SocketAddr) {
        let req = match InfoRequest::parse(buf) {
            Ok(r) => r,
            Err(err) => {
                warn!(%err, %addr, "malformed INFO request");
                return;
            }
        };
        debug!(%addr, "INFO");

        let reply = InfoReply {
            header: Header::build(Command::InfoReply, req.header.command_id(), 1),
            sector_size: self.block_device.sector_size(),
            sector_count: self.block_device.sector_count() as u32,
        };

        if let Err(err) = self.socket.send_to(&reply.pack(), addr) {
            error!(%err, %addr, "failed to send INFO_REPLY");
        }
    }

    fn handle_read(&mut self, buf: &[u8], addr: SocketAddr) {
        let req = match ReadWriteRequest::parse(buf) {
            Ok(r) => r,
            Err(err) => {
                warn!(%err, %addr, "malformed READ request");
                return;
            }
        };
        debug!(
            %addr,
            cmdid = req.header.command_id().value(),
            sector_nr = req.sector_nr,
            sector_count = req.sector_count,
            "READ"
        );

        if req.sector_count == 0 {
            debug!(%addr, "READ with sector_count=0, nothing to send");
            return;
        }

        let size_bytes = u32::from(req.sector_count) * self.block_device.sector_size();
        self.shift = BlockShiftState::new(
            select_block_shift(size_bytes),
            self.block_device.sector_size(),
        );

        if let Err(err) = self.block_device.seek(req.sector_nr) {
            error!(%err, %addr, "seek failed in READ, aborting transfer");
            return;
        }

        let mut blocks_left =
            u32::from(req.sector_count) * u32::from(self.shift.blocks_per_sector);
        let mut command_pkt: u8 = 1;

        while blocks_left > 0 {
            let block_count = blocks_left.min(u32::from(self.shift.blocks_per_packet));
            blocks_left -= block_count;

            let size = block_count as usize * self.shift.block_size as usize;
            let data = match self.block_device.read(size) {
                Ok(d) => d,
                Err(err) => {
                    error!(%err, %addr, "read failed in READ, zeroing remainder");
                    vec![0u8; size]
                }
            };

            let mut rdma = Rdma {
                header: Header::build(Command::ReadRdma, req.header.command_id(), command_pkt),
                block_type: BlockType::new_with_raw_value(0)
                    .with_block_shift(u4::new(self.shift.block_shift))
                    .with_block_count(u9::new(block_count as u16)),
                data: [0u8; RDMA_MAX_PAYLOAD],
            };
            rdma.data[..data.len()].copy_from_slice(&data);

            if let Err(err) = self.socket.send_to(&rdma.pack_sized(data.len()), addr) {
                error!(%err, %addr, "failed to send READ_RDMA");
            }

            command_pkt = command_pkt.wrapping_add(1);
        }
    }

    fn handle_write(&mut self, buf: &[u8]) {
        let req = match ReadWriteRequest::parse(buf) {
            Ok(r) => r,
            Err(err) => {
                warn!(%err, "malformed WRITE request");
                return;
            }
        };
        debug!(
            cmdid = req.header.command_id().value(),
            sector_nr = req.sector_nr,
            sector_count = req.sector_count,
            "WRITE"
        );

        self.write_size_left =
            u32::from(req.sector_count) as usize * self.block_device.sector_size() as usize;

        match self.block_device.seek(req.sector_nr) {
            Ok(()) => self.write_rdma_valid = true,
            Err(err) => {
                error!(%err, "seek failed in WRITE, dropping subsequent WRITE_RDMA");
                self.write_rdma_valid = false;
            }
        }
    }

    fn handle_write_rdma(&mut self, buf: &[u8], addr: SocketAddr) {
        let (req, received) = match Rdma::parse(buf) {
            Ok(r) => r,
            Err(err) => {
                warn!(%err, %addr, "malformed WRITE_RDMA");
                return;
            }
        };

        if !self.write_rdma_valid {
            warn!(%addr, "WRITE_RDMA with no active WRITE transaction, dropping");
            return;
        }

        let declared = match req.block_type.checked_blocks_size() {
            Ok(size) => size as usize,
            Err(err) => {
                warn!(%err, %addr, "WRITE_RDMA with unsupported block type, dropping");
                return;
            }
        };

        // `declared` comes straight from the client-controlled BlockType
        // and "should agree" with what was actually received but isn't
        // guaranteed to (§4.7) — never index `data` past what `Rdma::parse`
        // actually copied in, or past its fixed capacity.
        let write_len = declared.min(received).min(req.data.len());
        if let Err(err) = self.block_device.write(&req.data[..write_len]) {
            error!(%err, %addr, "write failed in WRITE_RDMA");
        }

        // write_size_left bookkeeping uses the BlockType-declared size, not
        // the clamped write length — §4.7 defines it that way even though
        // the two should agree.
        match self.write_size_left.checked_sub(declared) {
            Some(left) => self.write_size_left = left,
            None => {
                warn!(%addr, "write_size_left underflow, clamping to 0");
                self.write_size_left = 0;
            }
        }

        if self.write_size_left == 0 {
            self.write_rdma_valid = false;
            let reply = WriteReply {
                header: Header::build(
                    Command::WriteDone,
                    req.header.command_id(),
                    req.header.command_id().value() + 1,
                ),
                result: 0,
            };
            if let Err(err) = self.socket.send_to(&reply.pack(), addr) {
                error!(%err, %addr, "failed to send WRITE_DONE");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdevice::MemoryBlockDevice;
    use arbitrary_int::u3;
    use std::net::UdpSocket as StdUdpSocket;
    use std::time::Duration;

    fn test_server() -> (Server, SocketAddr) {
        let device = BlockDevice::Memory(MemoryBlockDevice::with_capacity(512, 64 * 1024));
        let server = Server::new(device, 0).unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    #[test]
    fn info_round_trip() {
        let (mut server, server_addr) = test_server();
        let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let request = InfoRequest {
            header: Header::build(Command::Info, u3::new(1), 0),
        };
        client.send_to(&request.pack(), server_addr).unwrap();

        server.recv_and_dispatch().unwrap();

        let mut buf = [0u8; UDP_MAX_PAYLOAD];
        let (n, _) = client.recv_from(&mut buf).unwrap();
        let reply = InfoReply::parse(&buf[..n]).unwrap();
        assert_eq!(reply.header.command().unwrap(), Command::InfoReply);
        assert_eq!(reply.header.command_id().value(), 1);
        assert_eq!(reply.header.command_pkt(), 1);
        assert_eq!(reply.sector_size, 512);
        assert_eq!(reply.sector_count, (64 * 1024) / 512);
    }

    #[test]
    fn read_emits_all_bytes_with_increasing_cmdpkt() {
        let (mut server, server_addr) = test_server();
        server.block_device.seek(0).unwrap();
        let seed: Vec<u8> = (0..4096u32).map(|b| b as u8).collect();
        server.block_device.write(&seed).unwrap();

        let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();

        let sector_count: u16 = 4; // 4 * 512 = 2048 bytes
        let request = ReadWriteRequest {
            header: Header::build(Command::Read, u3::new(2), 0),
            sector_nr: 0,
            sector_count,
        };
        client.send_to(&request.pack(), server_addr).unwrap();
        server.recv_and_dispatch().unwrap();

        let mut received = Vec::new();
        let mut last_cmdpkt = 0u8;
        let mut packets = 0u32;
        loop {
            let mut buf = [0u8; UDP_MAX_PAYLOAD];
            let (n, _) = match client.recv_from(&mut buf) {
                Ok(v) => v,
                Err(_) => break,
            };
            let (rdma, _received_len) = Rdma::parse(&buf[..n]).unwrap();
            assert_eq!(rdma.header.command().unwrap(), Command::ReadRdma);
            assert!(rdma.header.command_pkt() > last_cmdpkt);
            last_cmdpkt = rdma.header.command_pkt();
            let size = rdma.block_type.checked_blocks_size().unwrap() as usize;
            received.extend_from_slice(&rdma.data[..size]);
            packets += 1;
        }

        assert_eq!(received, seed[..2048]);
        assert_eq!(packets, last_cmdpkt as u32);
    }

    #[test]
    fn write_then_write_rdma_emits_single_write_done() {
        let (mut server, server_addr) = test_server();
        let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let write_req = ReadWriteRequest {
            header: Header::build(Command::Write, u3::new(4), 0),
            sector_nr: 2,
            sector_count: 2, // 2 * 512 = 1024 bytes
        };
        client.send_to(&write_req.pack(), server_addr).unwrap();
        server.recv_and_dispatch().unwrap();

        let payload_a: Vec<u8> = vec![0xAA; 512];
        let block_type = BlockType::for_block_size(512, u9::new(1)).unwrap();
        let rdma_a = Rdma {
            header: Header::build(Command::WriteRdma, u3::new(4), 1),
            block_type,
            data: {
                let mut d = [0u8; RDMA_MAX_PAYLOAD];
                d[..512].copy_from_slice(&payload_a);
                d
            },
        };
        client
            .send_to(&rdma_a.pack_sized(512), server_addr)
            .unwrap();
        server.recv_and_dispatch().unwrap();

        let payload_b: Vec<u8> = vec![0xBB; 512];
        let rdma_b = Rdma {
            header: Header::build(Command::WriteRdma, u3::new(4), 2),
            block_type,
            data: {
                let mut d = [0u8; RDMA_MAX_PAYLOAD];
                d[..512].copy_from_slice(&payload_b);
                d
            },
        };
        client
            .send_to(&rdma_b.pack_sized(512), server_addr)
            .unwrap();
        server.recv_and_dispatch().unwrap();

        let mut buf = [0u8; UDP_MAX_PAYLOAD];
        let (n, _) = client.recv_from(&mut buf).unwrap();
        let reply = WriteReply::parse(&buf[..n]).unwrap();
        assert_eq!(reply.header.command().unwrap(), Command::WriteDone);
        assert_eq!(reply.result, 0);

        server.block_device.seek(2).unwrap();
        let written = server.block_device.read(1024).unwrap();
        assert_eq!(&written[..512], &payload_a[..]);
        assert_eq!(&written[512..], &payload_b[..]);
    }

    #[test]
    fn read_with_sector_count_zero_sends_nothing() {
        let (mut server, server_addr) = test_server();
        let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();

        let request = ReadWriteRequest {
            header: Header::build(Command::Read, u3::new(0), 0),
            sector_nr: 0,
            sector_count: 0,
        };
        client.send_to(&request.pack(), server_addr).unwrap();
        server.recv_and_dispatch().unwrap();

        let mut buf = [0u8; UDP_MAX_PAYLOAD];
        assert!(client.recv_from(&mut buf).is_err());
    }

    #[test]
    fn write_rdma_with_declared_size_past_actual_payload_does_not_panic() {
        // A WRITE_RDMA can claim (via BlockType) far more data than the
        // datagram actually carries. The server must clamp to what was
        // really received instead of slicing `data` out of bounds.
        let (mut server, server_addr) = test_server();
        let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let write_req = ReadWriteRequest {
            header: Header::build(Command::Write, u3::new(1), 0),
            sector_nr: 0,
            sector_count: 2, // 1024 bytes expected
        };
        client.send_to(&write_req.pack(), server_addr).unwrap();
        server.recv_and_dispatch().unwrap();

        // Declares 10 blocks of 512 bytes (5120 bytes, well past the
        // 1466-byte RDMA payload cap) but only actually sends 100 bytes.
        let block_type = BlockType::for_block_size(512, u9::new(10)).unwrap();
        let rdma = Rdma {
            header: Header::build(Command::WriteRdma, u3::new(1), 1),
            block_type,
            data: [0x7Eu8; RDMA_MAX_PAYLOAD],
        };
        client
            .send_to(&rdma.pack_sized(100), server_addr)
            .unwrap();

        // Must not panic.
        server.recv_and_dispatch().unwrap();

        server.block_device.seek(0).unwrap();
        let written = server.block_device.read(100).unwrap();
        assert_eq!(written, vec![0x7Eu8; 100]);
    }

    #[test]
    fn write_rdma_with_illegal_block_shift_is_dropped_without_panic() {
        let (mut server, server_addr) = test_server();
        let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let write_req = ReadWriteRequest {
            header: Header::build(Command::Write, u3::new(1), 0),
            sector_nr: 0,
            sector_count: 1,
        };
        client.send_to(&write_req.pack(), server_addr).unwrap();
        server.recv_and_dispatch().unwrap();

        // block_shift is a 4-bit field; 15 is outside the legal 3..=7 range
        // and would shift a u16 by >=16 bits if not validated first.
        let header = Header::build(Command::WriteRdma, u3::new(1), 1);
        let block_type = BlockType::new_with_raw_value(0)
            .with_block_shift(u4::new(15))
            .with_block_count(u9::new(1));
        let rdma = Rdma {
            header,
            block_type,
            data: [0xFFu8; RDMA_MAX_PAYLOAD],
        };
        client
            .send_to(&rdma.pack_sized(64), server_addr)
            .unwrap();

        // Must not panic; the packet is dropped and the WRITE transaction
        // stays open (write_size_left untouched).
        server.recv_and_dispatch().unwrap();
        assert_eq!(server.write_size_left, 512);
    }
}
