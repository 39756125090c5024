//! Acquisition pipeline: configuration and lifecycle
//!
//! The pipeline owns the device behind a mutex and, while running, three
//! scheduler threads: the data-ready listener, the acquisition worker and the
//! streaming consumer. Construction is cheap and leaves the device untouched;
//! [`AcquisitionPipeline::start`] configures the device, enters streaming and
//! spawns the threads; [`AcquisitionPipeline::stop`] reverses that.

use super::handoff::{self, HandoffPolicy};
use super::scheduler::Scheduler;
use super::stats::{CounterSnapshot, Counters};
use super::wake::{self, Trigger};
use super::watchdog::Watchdog;
use crate::device::{Ads1299, DeviceState, Register};
use crate::nodes::acquisition::AcquisitionWorker;
use crate::nodes::decoder::{Baseline, SampleDecoder};
use crate::nodes::drdy::{DataReadyLine, DrdyListener, LineFault};
use crate::nodes::streaming::{StreamingConsumer, Transport};
use crate::nodes::types::FrameGeometry;
use crate::{AdsError, Result};
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info};

/// Pipeline settings, validated when the pipeline starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// 1-based channels to forward; `None` forwards all
    pub selection: Option<Vec<usize>>,
    pub handoff: HandoffPolicy,
    /// Baseline window in samples; `None` disables correction
    pub baseline: Option<usize>,
    /// Longest the listener blocks before re-checking the stop flag
    pub drdy_poll_timeout: Duration,
    pub watchdog_threshold: Duration,
    /// Check the ID register against the frame geometry before streaming
    pub verify_id: bool,
    /// Register writes applied in STANDBY before streaming
    pub registers: Vec<(Register, u8)>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            selection: None,
            handoff: HandoffPolicy::default(),
            baseline: None,
            drdy_poll_timeout: Duration::from_millis(100),
            watchdog_threshold: Watchdog::DEFAULT_THRESHOLD,
            verify_id: true,
            registers: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_selection(mut self, channels: impl Into<Vec<usize>>) -> Self {
        self.selection = Some(channels.into());
        self
    }

    pub fn with_handoff(mut self, policy: HandoffPolicy) -> Self {
        self.handoff = policy;
        self
    }

    /// Subtract the per-channel average of the first `window` samples
    pub fn with_baseline(mut self, window: usize) -> Self {
        self.baseline = Some(window);
        self
    }

    /// Baseline over the firmware's 500-sample window
    pub fn with_default_baseline(self) -> Self {
        self.with_baseline(Baseline::DEFAULT_WINDOW)
    }

    pub fn with_drdy_poll_timeout(mut self, timeout: Duration) -> Self {
        self.drdy_poll_timeout = timeout;
        self
    }

    pub fn with_watchdog_threshold(mut self, threshold: Duration) -> Self {
        self.watchdog_threshold = threshold;
        self
    }

    pub fn with_verify_id(mut self, verify: bool) -> Self {
        self.verify_id = verify;
        self
    }

    pub fn with_registers(mut self, registers: impl Into<Vec<(Register, u8)>>) -> Self {
        self.registers = registers.into();
        self
    }

    /// Build the decoder this configuration describes
    pub fn decoder(&self, geometry: FrameGeometry) -> Result<SampleDecoder> {
        let mut decoder = SampleDecoder::new(geometry);
        if let Some(selection) = &self.selection {
            decoder = decoder.with_selection(selection).map_err(AdsError::Config)?;
        }
        if let Some(window) = self.baseline {
            decoder = decoder.with_baseline(window);
        }
        Ok(decoder)
    }

    pub fn validate(&self, geometry: FrameGeometry) -> Result<()> {
        self.handoff.validate().map_err(AdsError::Config)?;
        if self.drdy_poll_timeout.is_zero() {
            return Err(AdsError::Config(
                "data-ready poll timeout must be non-zero".to_string(),
            ));
        }
        if self.watchdog_threshold.is_zero() {
            return Err(AdsError::Config(
                "watchdog threshold must be non-zero".to_string(),
            ));
        }
        self.decoder(geometry).map(|_| ())
    }
}

/// Threads and signals that exist only while streaming
struct Running {
    scheduler: Scheduler,
    stop: Arc<AtomicBool>,
    trigger: Trigger,
    line_fault: LineFault,
}

pub struct AcquisitionPipeline<SPI, CS, RST, D>
where
    SPI: SpiBus + Send + 'static,
    CS: OutputPin + Send + 'static,
    RST: OutputPin + Send + 'static,
    D: DelayNs + Send + 'static,
{
    device: Arc<Mutex<Ads1299<SPI, CS, RST, D>>>,
    config: PipelineConfig,
    counters: Arc<Counters>,
    running: Option<Running>,
}

impl<SPI, CS, RST, D> AcquisitionPipeline<SPI, CS, RST, D>
where
    SPI: SpiBus + Send + 'static,
    CS: OutputPin + Send + 'static,
    RST: OutputPin + Send + 'static,
    D: DelayNs + Send + 'static,
{
    /// Take ownership of a device, normally already powered up to STANDBY
    pub fn new(device: Ads1299<SPI, CS, RST, D>, config: PipelineConfig) -> Self {
        Self {
            device: Arc::new(Mutex::new(device)),
            config,
            counters: Arc::new(Counters::new()),
            running: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn device_state(&self) -> DeviceState {
        self.lock_device().state()
    }

    /// Run `f` with exclusive access to the device. While streaming, register
    /// access is rejected by the device state machine.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut Ads1299<SPI, CS, RST, D>) -> R) -> R {
        f(&mut self.lock_device())
    }

    /// Trigger for an external data-ready source, such as a GPIO interrupt
    pub fn trigger(&self) -> Option<Trigger> {
        self.running.as_ref().map(|r| r.trigger.clone())
    }

    /// Start streaming with a listener thread polling `line` for edges
    pub fn start<L, T>(&mut self, line: L, transport: T) -> Result<()>
    where
        L: DataReadyLine + 'static,
        T: Transport + 'static,
    {
        self.launch(Some(Box::new(line)), Box::new(transport))
    }

    /// Start streaming without a listener; edges are posted through the
    /// returned [`Trigger`]
    pub fn start_external<T>(&mut self, transport: T) -> Result<Trigger>
    where
        T: Transport + 'static,
    {
        self.launch(None, Box::new(transport))?;
        self.trigger()
            .ok_or_else(|| AdsError::Config("pipeline did not start".to_string()))
    }

    fn launch(
        &mut self,
        line: Option<Box<dyn DataReadyLine>>,
        transport: Box<dyn Transport>,
    ) -> Result<()> {
        if self.running.is_some() {
            return Err(AdsError::AlreadyRunning);
        }

        let geometry = self.lock_device().geometry();
        self.config.validate(geometry)?;
        let decoder = self.config.decoder(geometry)?;

        {
            let mut device = self.lock_device();
            if self.config.verify_id {
                device.verify_id()?;
            }
            device.apply_config(&self.config.registers)?;
            device.start_streaming()?;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (trigger, wake_rx) = wake::channel(Arc::clone(&self.counters));
        let (publisher, consumer) = handoff::channel(self.config.handoff, Arc::clone(&self.counters));
        let scheduler = match Scheduler::with_watchdog_threshold(self.config.watchdog_threshold) {
            Ok(scheduler) => scheduler,
            Err(e) => {
                self.lock_device().stop_streaming()?;
                return Err(e.into());
            }
        };

        self.running = Some(Running {
            scheduler,
            stop: Arc::clone(&stop),
            trigger: trigger.clone(),
            line_fault: LineFault::default(),
        });

        let spawned = self.spawn_nodes(line, transport, trigger, wake_rx, publisher, consumer, decoder);
        if let Err(e) = spawned {
            error!("Failed to start pipeline threads: {}", e);
            let _ = self.stop();
            return Err(e);
        }

        info!(
            "Acquisition pipeline started: {} channels, {} forwarded, {:?}",
            geometry.channels(),
            self.config
                .selection
                .as_ref()
                .map_or(geometry.channels(), Vec::len),
            self.config.handoff
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_nodes(
        &mut self,
        line: Option<Box<dyn DataReadyLine>>,
        transport: Box<dyn Transport>,
        trigger: Trigger,
        wake_rx: wake::WakeReceiver,
        publisher: handoff::SamplePublisher,
        consumer: handoff::SampleConsumer,
        decoder: SampleDecoder,
    ) -> Result<()> {
        let counters = Arc::clone(&self.counters);
        let device = Arc::clone(&self.device);
        let running = self
            .running
            .as_mut()
            .ok_or_else(|| AdsError::Config("pipeline is not running".to_string()))?;
        let watchdog = running.scheduler.watchdog().clone();

        let streaming = StreamingConsumer::new(consumer, transport, Arc::clone(&counters))
            .with_watchdog(watchdog.register("streaming", "send", "transport", false));
        running.scheduler.start_process(Box::new(streaming))?;

        let worker = AcquisitionWorker::new(
            device,
            wake_rx,
            decoder,
            publisher,
            Arc::clone(&running.stop),
            counters,
        )
        .with_watchdog(watchdog.register("acquisition", "transfer", "spi", true));
        running.scheduler.start_process(Box::new(worker))?;

        if let Some(line) = line {
            let listener = DrdyListener::new(line, trigger, Arc::clone(&running.stop))
                .with_poll_timeout(self.config.drdy_poll_timeout)
                .with_fault_slot(Arc::clone(&running.line_fault));
            running.scheduler.start_process(Box::new(listener))?;
        }
        Ok(())
    }

    /// Report a transfer stuck longer than the watchdog threshold, or a
    /// data-ready line that failed and ended the listener
    pub fn check_health(&self) -> Result<()> {
        let Some(running) = &self.running else {
            return Ok(());
        };
        if let Some(err) = Self::stall_error(running) {
            return Err(err);
        }
        match *running
            .line_fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            Some(kind) => Err(AdsError::DataReadyLost(kind)),
            None => Ok(()),
        }
    }

    fn stall_error(running: &Running) -> Option<AdsError> {
        running
            .scheduler
            .watchdog()
            .stalled()
            .map(|report| AdsError::Stalled {
                node: report.node,
                operation: report.operation,
                resource: report.resource,
                blocked: report.blocked,
            })
    }

    /// Stop streaming and join all pipeline threads. The device is left in
    /// STANDBY. Calling stop on a stopped pipeline does nothing.
    ///
    /// After a stalled transfer the worker still holds the device, so the
    /// threads are signalled and detached instead and the stall is returned.
    pub fn stop(&mut self) -> Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        debug!("Stopping acquisition pipeline");

        running.stop.store(true, Ordering::Release);
        if let Some(err) = Self::stall_error(&running) {
            error!("Abandoning pipeline threads: {}", err);
            running.scheduler.stop();
            running.trigger.nudge();
            running.scheduler.watchdog().stop();
            return Err(err);
        }
        let stopped = {
            let mut device = self.lock_device();
            if device.state() == DeviceState::Streaming {
                device.stop_streaming().map(|_| ())
            } else {
                Ok(())
            }
        };

        // Wake the worker so it observes the stop flag
        running.trigger.nudge();
        drop(running.trigger);
        running.scheduler.wait();

        info!("Acquisition pipeline stopped: {}", self.counters.snapshot());
        stopped.map_err(AdsError::from)
    }

    /// Stop and hand the device back
    pub fn into_device(mut self) -> Result<Ads1299<SPI, CS, RST, D>> {
        self.stop()?;
        let device = Arc::clone(&self.device);
        drop(self);
        Arc::try_unwrap(device)
            .map(|mutex| mutex.into_inner().unwrap_or_else(PoisonError::into_inner))
            .map_err(|_| AdsError::DeviceBusy)
    }

    fn lock_device(&self) -> MutexGuard<'_, Ads1299<SPI, CS, RST, D>> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<SPI, CS, RST, D> Drop for AcquisitionPipeline<SPI, CS, RST, D>
where
    SPI: SpiBus + Send + 'static,
    CS: OutputPin + Send + 'static,
    RST: OutputPin + Send + 'static,
    D: DelayNs + Send + 'static,
{
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Pipeline stop on drop failed: {}", e);
        }
    }
}
