//! Acquisition worker: one wake in, at most one sample out
//!
//! The worker is the only bus user while the device streams. For every wake
//! it locks the device for exactly one frame transaction, decodes the frame
//! and publishes the sample. Failed transfers are logged, counted and the
//! frame dropped; there are no retries.

use super::decoder::SampleDecoder;
use super::types::RawFrame;
use crate::device::{Ads1299, DeviceError, DeviceState};
use crate::runtime::errors::HandoffError;
use crate::runtime::handoff::SamplePublisher;
use crate::runtime::node::{ProcessNode, WorkError, WorkResult};
use crate::runtime::stats::{Counters, bump};
use crate::runtime::wake::WakeReceiver;
use crate::runtime::watchdog::WatchdogHandle;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace, warn};

/// Something the worker can clock frames out of
pub trait FrameSource: Send {
    fn is_streaming(&self) -> bool;

    fn read_frame(&mut self) -> Result<RawFrame, DeviceError>;
}

impl<SPI, CS, RST, D> FrameSource for Ads1299<SPI, CS, RST, D>
where
    SPI: SpiBus + Send,
    CS: OutputPin + Send,
    RST: OutputPin + Send,
    D: DelayNs + Send,
{
    fn is_streaming(&self) -> bool {
        self.state() == DeviceState::Streaming && self.phase() == crate::device::Phase::Idle
    }

    fn read_frame(&mut self) -> Result<RawFrame, DeviceError> {
        Ads1299::read_frame(self)
    }
}

pub struct AcquisitionWorker<S> {
    name: String,
    device: Arc<Mutex<S>>,
    wake: WakeReceiver,
    decoder: SampleDecoder,
    publisher: SamplePublisher,
    stop: Arc<AtomicBool>,
    counters: Arc<Counters>,
    transfer_watch: Option<WatchdogHandle>,
}

impl<S: FrameSource> AcquisitionWorker<S> {
    pub fn new(
        device: Arc<Mutex<S>>,
        wake: WakeReceiver,
        decoder: SampleDecoder,
        publisher: SamplePublisher,
        stop: Arc<AtomicBool>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            name: "acquisition".to_string(),
            device,
            wake,
            decoder,
            publisher,
            stop,
            counters,
            transfer_watch: None,
        }
    }

    /// Watch each frame transfer; register the handle as fatal
    pub fn with_watchdog(mut self, handle: WatchdogHandle) -> Self {
        self.transfer_watch = Some(handle);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// One locked transaction. `None` means no frame should be read.
    fn capture(&mut self) -> WorkResult<Option<Result<RawFrame, DeviceError>>> {
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        // Checked under the device lock so no transfer can follow STOP
        if self.stop.load(Ordering::Acquire) {
            return Err(WorkError::Shutdown);
        }
        if !device.is_streaming() {
            trace!("[{}] Wake while not streaming, ignored", self.name);
            return Ok(None);
        }
        let _guard = self.transfer_watch.as_ref().map(WatchdogHandle::guard);
        Ok(Some(device.read_frame()))
    }
}

impl<S: FrameSource> ProcessNode for AcquisitionWorker<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn work(&mut self) -> WorkResult<usize> {
        self.wake.wait()?;

        let frame = match self.capture()? {
            None => return Ok(0),
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                bump(&self.counters.bus_errors);
                warn!("[{}] Frame dropped: {}", self.name, e);
                return Ok(0);
            }
        };
        bump(&self.counters.frames_read);

        let status = frame.status();
        if !status.is_valid() {
            bump(&self.counters.status_errors);
            debug!(
                "[{}] Unexpected status header 0b{:04b}",
                self.name, status.header
            );
        }

        let sample = self.decoder.decode(&frame);
        match self.publisher.publish(sample) {
            Ok(()) => Ok(1),
            // already logged and counted by the publisher
            Err(HandoffError::Full { .. }) => Ok(0),
            Err(HandoffError::Closed) => {
                debug!("[{}] Consumer gone", self.name);
                Err(WorkError::Shutdown)
            }
        }
    }
}
