//! Power-up and command timing

use embedded_hal::delay::DelayNs;
use std::time::Duration;

/// Delays applied by [`Ads1299::power_up`](super::Ads1299::power_up) and after
/// every command byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerUpTiming {
    /// Supply ramp before anything else happens
    pub power_on_delay: Duration,
    /// Power-on-reset time (tPOR)
    pub por_delay: Duration,
    /// RESET held active
    pub reset_pulse_width: Duration,
    /// Wait after RESET is released, before the first command
    pub reset_settle: Duration,
    /// Reference and oscillator stabilization after reset
    pub stabilize_delay: Duration,
    /// Gap after each command byte (4 tCLK minimum, generous here)
    pub command_spacing: Duration,
}

impl PowerUpTiming {
    /// All delays zero, for simulators and tests
    pub fn immediate() -> Self {
        Self {
            power_on_delay: Duration::ZERO,
            por_delay: Duration::ZERO,
            reset_pulse_width: Duration::ZERO,
            reset_settle: Duration::ZERO,
            stabilize_delay: Duration::ZERO,
            command_spacing: Duration::ZERO,
        }
    }

    pub fn with_power_on_delay(mut self, delay: Duration) -> Self {
        self.power_on_delay = delay;
        self
    }

    pub fn with_stabilize_delay(mut self, delay: Duration) -> Self {
        self.stabilize_delay = delay;
        self
    }

    pub fn with_command_spacing(mut self, spacing: Duration) -> Self {
        self.command_spacing = spacing;
        self
    }

    /// The settle time after releasing RESET must not be shorter than the pulse
    pub fn validate(&self) -> Result<(), String> {
        if self.reset_settle < self.reset_pulse_width {
            return Err(format!(
                "reset settle time {:?} is shorter than reset pulse width {:?}",
                self.reset_settle, self.reset_pulse_width
            ));
        }
        Ok(())
    }
}

impl Default for PowerUpTiming {
    fn default() -> Self {
        Self {
            power_on_delay: Duration::from_secs(1),
            por_delay: Duration::from_millis(70),
            reset_pulse_width: Duration::from_micros(10),
            reset_settle: Duration::from_micros(18),
            stabilize_delay: Duration::from_secs(1),
            command_spacing: Duration::from_micros(30),
        }
    }
}

/// Run `duration` through a [`DelayNs`], splitting anything longer than a
/// `u32` worth of nanoseconds into millisecond chunks.
pub(crate) fn delay_for<D: DelayNs>(delay: &mut D, duration: Duration) {
    if duration.is_zero() {
        return;
    }
    let nanos = duration.as_nanos();
    if nanos <= u32::MAX as u128 {
        delay.delay_ns(nanos as u32);
        return;
    }
    let mut millis = duration.as_millis();
    while millis > 0 {
        let chunk = millis.min(u32::MAX as u128) as u32;
        delay.delay_ms(chunk);
        millis -= chunk as u128;
    }
}
