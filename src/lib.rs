//! ADS1299 acquisition pipeline
//!
//! Drives an ADS1299-family delta-sigma analog front end over `embedded-hal`
//! SPI and forwards decoded 24-bit samples to a downstream transport in real
//! time.
//!
//! # Architecture
//!
//! - **Device**: bus framing, lifecycle state machine and the [`Ads1299`] driver
//! - **Trigger**: data-ready edges post a coalescing wake, nothing more
//! - **Acquisition worker**: one SPI frame per wake, decoded and published
//! - **Hand-off**: overwrite-latest slot or fixed-capacity queue
//! - **Streaming consumer**: encodes samples and sends them when a peer is connected
//! - **Scheduler**: thread-per-node execution with a stall watchdog
//!
//! # Example
//!
//! ```no_run
//! use ads1299::sim::SimulatedChip;
//! use ads1299::{AcquisitionPipeline, FrameGeometry, PipelineConfig, UdpTransport};
//!
//! let chip = SimulatedChip::new(8);
//! let mut device = chip.device(FrameGeometry::new(8).unwrap());
//! device.init()?;
//! device.power_up()?;
//!
//! let mut pipeline = AcquisitionPipeline::new(device, PipelineConfig::new().with_selection([1, 2, 3, 4]));
//! let mut transport = UdpTransport::bind("0.0.0.0:0")?;
//! transport.connect("127.0.0.1:9000".parse()?);
//! pipeline.start(chip.data_ready(250.0), transport)?;
//! // ...
//! pipeline.stop()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::time::Duration;
use thiserror::Error;

pub mod device;
pub mod nodes;
pub mod runtime;
pub mod sim;

pub use device::{
    Ads1299, BusError, Command, DeviceError, DeviceId, DeviceState, IllegalTransition,
    PowerUpTiming, Register,
};
pub use nodes::{
    DataReadyLine, DecodedSample, FrameGeometry, FrameStatus, PolledDataReady, RawFrame,
    SampleDecoder, Transport, TransportError, UdpTransport,
};
pub use runtime::{
    AcquisitionPipeline, CounterSnapshot, HandoffError, HandoffPolicy, PipelineConfig,
    ProcessNode, Scheduler, Trigger, WorkError, WorkResult,
};

#[derive(Error, Debug)]
pub enum AdsError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Hand-off error: {0}")]
    Handoff(#[from] HandoffError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[{node}] {operation} on '{resource}' stalled for {blocked:?}")]
    Stalled {
        node: String,
        operation: String,
        resource: String,
        blocked: Duration,
    },

    #[error("Data-ready line failed: {0}")]
    DataReadyLost(embedded_hal::digital::ErrorKind),

    #[error("Pipeline is already running")]
    AlreadyRunning,

    #[error("Device is still shared with a running pipeline")]
    DeviceBusy,
}

pub type Result<T> = std::result::Result<T, AdsError>;
