mod blockdevice;
mod protocol;
mod server;
mod shift;
mod status;
mod utils;

use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use blockdevice::{BlockDevice, FileBlockDevice, MemoryBlockDevice};
use protocol::UDPBD_PORT;
use server::Server;

#[derive(Parser, Debug)]
#[command(version, arg_required_else_help = true)]
pub struct Args {
    /// Raw device or mount point to expose over UDPBD
    #[arg(long)]
    pub path: PathBuf,

    /// Sector size of the block device
    #[arg(long, default_value_t = 512)]
    pub sector_size: u32,

    /// Open the block device read-only
    #[arg(long = "read-only", visible_alias = "ro")]
    pub read_only: bool,

    /// Serve an in-memory buffer instead of opening `path`
    #[arg(long = "test-mode")]
    pub test_mode: bool,

    /// UDP port to listen on
    #[arg(long, default_value_t = UDPBD_PORT)]
    pub port: u16,

    /// Interval between status log lines, in seconds
    #[arg(long, default_value_t = 10)]
    pub status_interval: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let block_device = if args.test_mode {
        BlockDevice::Memory(MemoryBlockDevice::new(args.sector_size))
    } else {
        BlockDevice::File(
            FileBlockDevice::open(&args.path, args.sector_size, args.read_only)
                .with_context(|| format!("failed to open block device {}", args.path.display()))?,
        )
    };

    info!(
        path = %args.path.display(),
        test_mode = args.test_mode,
        read_only = block_device.is_read_only(),
        sector_size = block_device.sector_size(),
        sector_count = block_device.sector_count(),
        "block device opened"
    );

    let mut server = Server::new(block_device, args.port).context("failed to start server")?;

    let _reporter = status::spawn_reporter(server.counters(), Duration::from_secs(args.status_interval));

    server.run(Duration::from_secs(1));

    Ok(())
}
