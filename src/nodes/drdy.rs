//! Data-ready edge sources and the listener node that turns edges into wakes
//!
//! On a microcontroller the DRDY falling edge is an interrupt whose handler
//! only calls [`Trigger::fire`]. On a host the same role is played by
//! [`DrdyListener`], which blocks on a [`DataReadyLine`] and posts a wake per
//! edge. Neither ever touches the bus.

use crate::runtime::node::{ProcessNode, WorkError, WorkResult};
use crate::runtime::wake::Trigger;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{self, Error as _, InputPin};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error};

/// Where a listener records the error that ended it
pub type LineFault = Arc<Mutex<Option<digital::ErrorKind>>>;

/// A source of data-ready edges
pub trait DataReadyLine: Send {
    /// Wait up to `timeout` for the next data-ready edge.
    /// Returns `Ok(false)` when the timeout expired without an edge.
    fn poll_edge(&mut self, timeout: Duration) -> Result<bool, digital::ErrorKind>;
}

impl<L: DataReadyLine + ?Sized> DataReadyLine for Box<L> {
    fn poll_edge(&mut self, timeout: Duration) -> Result<bool, digital::ErrorKind> {
        (**self).poll_edge(timeout)
    }
}

/// DRDY sampled through an [`InputPin`]; an edge is a high-to-low change
pub struct PolledDataReady<P, D> {
    pin: P,
    delay: D,
    poll_interval: Duration,
    last_high: bool,
}

impl<P: InputPin, D: DelayNs> PolledDataReady<P, D> {
    pub fn new(pin: P, delay: D) -> Self {
        Self {
            pin,
            delay,
            poll_interval: Duration::from_micros(50),
            last_high: true,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn release(self) -> (P, D) {
        (self.pin, self.delay)
    }
}

impl<P, D> DataReadyLine for PolledDataReady<P, D>
where
    P: InputPin + Send,
    D: DelayNs + Send,
{
    fn poll_edge(&mut self, timeout: Duration) -> Result<bool, digital::ErrorKind> {
        let mut waited = Duration::ZERO;
        loop {
            let high = self.pin.is_high().map_err(|e| e.kind())?;
            let falling = self.last_high && !high;
            self.last_high = high;
            if falling {
                return Ok(true);
            }
            if waited >= timeout {
                return Ok(false);
            }
            let step = self.poll_interval.max(Duration::from_nanos(1));
            self.delay.delay_ns(step.as_nanos().min(u32::MAX as u128) as u32);
            waited += step;
        }
    }
}

/// Listener node: one wake per data-ready edge
pub struct DrdyListener<L> {
    name: String,
    line: L,
    trigger: Trigger,
    poll_timeout: Duration,
    stop: Arc<AtomicBool>,
    fault: Option<LineFault>,
}

impl<L: DataReadyLine> DrdyListener<L> {
    pub fn new(line: L, trigger: Trigger, stop: Arc<AtomicBool>) -> Self {
        Self {
            name: "drdy".to_string(),
            line,
            trigger,
            poll_timeout: Duration::from_millis(100),
            stop,
            fault: None,
        }
    }

    /// Upper bound on how long a stop request can go unnoticed
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Record a line failure in `fault` before the listener ends
    pub fn with_fault_slot(mut self, fault: LineFault) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<L: DataReadyLine> ProcessNode for DrdyListener<L> {
    fn name(&self) -> &str {
        &self.name
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn work(&mut self) -> WorkResult<usize> {
        match self.line.poll_edge(self.poll_timeout) {
            Ok(true) => {
                if !self.trigger.fire() {
                    debug!("[{}] Edge coalesced into pending wake", self.name);
                }
                Ok(1)
            }
            Ok(false) => Ok(0),
            Err(kind) => {
                error!("[{}] Data-ready line failed: {}", self.name, kind);
                if let Some(fault) = &self.fault {
                    *fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(kind);
                }
                Err(WorkError::NodeError(format!("data-ready line: {kind}")))
            }
        }
    }
}
