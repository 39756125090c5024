//! Stream samples from a simulated ADS1299 over UDP
//!
//! Powers up the simulated chip, starts the acquisition pipeline and prints
//! pipeline counters once per second. Each sample goes out as one datagram of
//! 3-byte big-endian words, one per forwarded channel.
//!
//! Usage:
//!   cargo run --release --bin ads-stream -- \
//!       --channels 8 --select 1,2,3,4 \
//!       --peer 127.0.0.1:9000 --duration 10
//!
//! Latest-sample hand-off with a 500-sample baseline:
//!   cargo run --release --bin ads-stream -- \
//!       --policy latest --baseline 500 --peer 127.0.0.1:9000

use ads1299::device::registers::REGISTERS;
use ads1299::sim::{SimDelay, SimulatedChip};
use ads1299::{
    AcquisitionPipeline, Ads1299, FrameGeometry, HandoffPolicy, PipelineConfig, PowerUpTiming,
    UdpTransport,
};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Policy {
    /// Fixed-capacity FIFO; samples are dropped when it is full
    Queue,
    /// Single slot holding the newest sample
    Latest,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input channels on the device (4, 6 or 8)
    #[arg(long, default_value_t = 8)]
    channels: usize,

    /// 1-based channels to forward, comma separated (default: all)
    #[arg(long, value_delimiter = ',')]
    select: Vec<usize>,

    /// Hand-off policy between acquisition and streaming
    #[arg(long, value_enum, default_value_t = Policy::Queue)]
    policy: Policy,

    /// Queue capacity in samples
    #[arg(long, default_value_t = HandoffPolicy::DEFAULT_CAPACITY)]
    capacity: usize,

    /// Sample rate of the simulated data-ready line in Hz
    #[arg(long, default_value_t = 250.0)]
    rate: f64,

    /// Baseline window in samples (0 = no baseline correction)
    #[arg(long, default_value_t = 0)]
    baseline: usize,

    /// UDP peer to stream to; samples are discarded without one
    #[arg(long)]
    peer: Option<SocketAddr>,

    /// Local UDP bind address
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Seconds to stream (0 = until killed)
    #[arg(short, long, default_value_t = 10)]
    duration: u64,

    /// Honour the real power-up delays instead of skipping them
    #[arg(long)]
    real_time_power_up: bool,

    /// Supply ramp before the reset pulse, in milliseconds
    #[arg(long, default_value_t = 1000)]
    power_on_ms: u64,

    /// Reference settling after reset, in milliseconds
    #[arg(long, default_value_t = 1000)]
    stabilize_ms: u64,

    /// Gap after each command byte, in microseconds
    #[arg(long, default_value_t = 30)]
    command_spacing_us: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let geometry = FrameGeometry::new(args.channels)
        .ok_or_else(|| format!("unsupported channel count {}", args.channels))?;
    let chip = SimulatedChip::new(args.channels);

    let mut device = if args.real_time_power_up {
        Ads1299::new(
            chip.bus(),
            chip.chip_select(),
            chip.reset_pin(),
            SimDelay::real_time(),
            geometry,
        )
        .with_timing(
            PowerUpTiming::default()
                .with_power_on_delay(Duration::from_millis(args.power_on_ms))
                .with_stabilize_delay(Duration::from_millis(args.stabilize_ms))
                .with_command_spacing(Duration::from_micros(args.command_spacing_us)),
        )
    } else {
        chip.device(geometry)
    };

    info!("=== ADS1299 Stream ===");
    device.init()?;
    device.power_up()?;
    let id = device.verify_id()?;
    info!("Device ID 0x{:02X}, revision {}", id.0, id.revision());

    let mut config = PipelineConfig::new().with_handoff(match args.policy {
        Policy::Queue => HandoffPolicy::queue(args.capacity),
        Policy::Latest => HandoffPolicy::overwrite_latest(),
    });
    if !args.select.is_empty() {
        config = config.with_selection(args.select.clone());
    }
    if args.baseline > 0 {
        config = config.with_baseline(args.baseline);
    }

    let mut transport = UdpTransport::bind(args.bind)?;
    if let Some(peer) = args.peer {
        transport.connect(peer);
    }

    let mut pipeline = AcquisitionPipeline::new(device, config);
    pipeline.start(chip.data_ready(args.rate), transport)?;

    let started = Instant::now();
    let limit = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    loop {
        thread::sleep(Duration::from_secs(1));
        info!("{}", pipeline.counters());
        // A stalled worker still holds the device; exit without a clean stop
        if let Err(e) = pipeline.check_health() {
            error!("{}", e);
            return Err(e.into());
        }
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
    }

    let mut device = pipeline.into_device()?;
    info!("Stopped in {}; register map:", device.state());
    let map = device.dump_registers()?;
    for register in REGISTERS {
        info!(
            "  {:<10} 0x{:02X}",
            register.name(),
            map[register.addr() as usize]
        );
    }
    Ok(())
}
