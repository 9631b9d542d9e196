use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::{ensure, eyre};
use glassgadget::lun::{DEFAULT_BLOCK_COUNT, DEFAULT_BLOCK_SIZE, LogicalUnit, RamDisk};
use glassgadget::usb::function::MassStorageFunction;
use glassgadget::usb::gadget::{self, FunctionConfig};
use glassgadget::usb::host::UsbDrive;
use tracing::{Level, info};

#[derive(Debug, Parser)]
#[command(name = "glassgadget", version)]
#[command(about = "Emulate a USB mass storage function backed by RAM disks", long_about = None)]
struct Args {
    /// Number of logical units to expose.
    #[arg(long, default_value_t = 1)]
    luns: u8,
    /// Logical block size of every RAM disk, in bytes.
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: u32,
    /// Number of blocks of every RAM disk.
    #[arg(long, default_value_t = DEFAULT_BLOCK_COUNT)]
    block_count: u32,
    /// wMaxPacketSize of the bulk endpoints.
    #[arg(long, default_value_t = gadget::DEFAULT_MAX_PACKET_SIZE)]
    max_packet_size: usize,
    /// Bulk-IN transfers that may be queued.
    #[arg(long, default_value_t = gadget::DEFAULT_IN_QUEUE_DEPTH)]
    in_queue_depth: usize,
    /// Bulk-OUT transfers that may be in flight.
    #[arg(long = "out-transfers", default_value_t = gadget::DEFAULT_OUT_TRANSFERS_IN_FLIGHT)]
    out_transfers_in_flight: usize,
    /// Packets per bulk transfer.
    #[arg(long, default_value_t = gadget::DEFAULT_OUT_PACKETS_PER_TRANSFER)]
    out_packets_per_transfer: usize,
    /// Vendor identification reported by INQUIRY (up to 8 bytes).
    #[arg(long, default_value = "GLASS")]
    vendor: String,
    /// Product identification reported by INQUIRY (up to 16 bytes).
    #[arg(long, default_value = "RAM DISK")]
    product: String,
    /// Raise the log level (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .init();

    let units = (0..args.luns)
        .map(|_| -> Result<Box<dyn LogicalUnit>> {
            let disk = RamDisk::new(args.block_size, args.block_count)?
                .with_identity(&args.vendor, &args.product)?;
            Ok(Box::new(disk))
        })
        .collect::<Result<Vec<_>>>()?;
    let function = MassStorageFunction::new(units)?;
    let config = FunctionConfig {
        max_packet_size: args.max_packet_size,
        in_queue_depth: args.in_queue_depth,
        out_transfers_in_flight: args.out_transfers_in_flight,
        out_packets_per_transfer: args.out_packets_per_transfer,
    };
    let (port, endpoints) = gadget::endpoints(&config)?;
    let served = tokio::spawn(gadget::serve(function, endpoints));

    // play the host: enumerate, then push one block through every unit
    let mut drive = UsbDrive::open(port).await?;
    let block_size = drive
        .luns()
        .first()
        .ok_or_else(|| eyre!("function exposes no logical units"))?
        .block_size() as usize;
    let pattern: Vec<u8> = (0..block_size).map(|i| (i % 256) as u8).collect();
    for lun in 0..drive.luns().len() as u8 {
        drive.write(lun, 0, &pattern).await?;
        ensure!(
            drive.read(lun, 0, 1).await? == pattern,
            "logical unit {lun} returned different data than was written"
        );
        drive.verify(lun, 0, &pattern).await?;
        info!(lun, "write, read and verify succeeded");
    }

    drop(drive);
    let function = served.await??;
    info!(max_lun = function.max_lun(), "function stopped");
    Ok(())
}
