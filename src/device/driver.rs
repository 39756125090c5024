//! ADS1299 driver over `embedded-hal` SPI, chip-select, reset and delay
//!
//! The driver owns the bus handles and the [`StateMachine`]. Every public
//! operation validates its transition first, then talks to the bus, then
//! commits the new state only if the bus operation succeeded.

use super::registers::{
    Command, FramingError, REGISTER_COUNT, Register, encode_command, encode_register_read_burst,
    encode_register_write,
};
use super::state::{DeviceState, IllegalTransition, Operation, Phase, StateMachine};
use super::timing::{PowerUpTiming, delay_for};
use crate::nodes::types::{FrameGeometry, RawFrame};
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{self, Error as _, OutputPin};
use embedded_hal::spi::{self, Error as _, SpiBus};
use thiserror::Error;
use tracing::{debug, info, trace};

/// Low-level bus failure, with the HAL error reduced to its kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("SPI transfer failed: {0}")]
    Spi(spi::ErrorKind),

    #[error("Chip select pin failed: {0}")]
    ChipSelect(digital::ErrorKind),

    #[error("Reset pin failed: {0}")]
    Reset(digital::ErrorKind),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("Unexpected device ID 0x{0:02X}")]
    UnexpectedId(u8),

    #[error("Device has {reported} channels but {configured} are configured")]
    ChannelMismatch { reported: usize, configured: usize },

    #[error("Invalid timing: {0}")]
    Timing(String),
}

/// Decoded ID register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId(pub u8);

impl DeviceId {
    /// Bits 4..2 read back as `111` on every part of the family
    pub fn is_valid(&self) -> bool {
        self.0 & 0x1C == 0x1C
    }

    pub fn channel_count(&self) -> Option<usize> {
        match self.0 & 0x03 {
            0b00 => Some(4),
            0b01 => Some(6),
            0b10 => Some(8),
            _ => None,
        }
    }

    /// Revision bits 7..5
    pub fn revision(&self) -> u8 {
        self.0 >> 5
    }
}

/// Driver for one ADS1299-family device
///
/// CS and RESET are both active low.
pub struct Ads1299<SPI, CS, RST, D> {
    spi: SPI,
    cs: CS,
    reset: RST,
    delay: D,
    geometry: FrameGeometry,
    timing: PowerUpTiming,
    state: StateMachine,
}

impl<SPI, CS, RST, D> Ads1299<SPI, CS, RST, D>
where
    SPI: SpiBus,
    CS: OutputPin,
    RST: OutputPin,
    D: DelayNs,
{
    pub fn new(spi: SPI, cs: CS, reset: RST, delay: D, geometry: FrameGeometry) -> Self {
        Self {
            spi,
            cs,
            reset,
            delay,
            geometry,
            timing: PowerUpTiming::default(),
            state: StateMachine::new(),
        }
    }

    pub fn with_timing(mut self, timing: PowerUpTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn state(&self) -> DeviceState {
        self.state.state()
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn timing(&self) -> &PowerUpTiming {
        &self.timing
    }

    /// Hand back the HAL parts
    pub fn release(self) -> (SPI, CS, RST, D) {
        (self.spi, self.cs, self.reset, self.delay)
    }

    /// Readiness check: drive CS and RESET inactive. UNINITIALIZED -> POWERED_DOWN.
    pub fn init(&mut self) -> Result<DeviceState, DeviceError> {
        let next = self.state.check(Operation::ReadinessCheck)?;
        self.timing.validate().map_err(DeviceError::Timing)?;
        self.cs
            .set_high()
            .map_err(|e| BusError::ChipSelect(e.kind()))?;
        self.reset
            .set_high()
            .map_err(|e| BusError::Reset(e.kind()))?;
        self.state.commit(next);
        info!("ADS1299 bus ready ({} channels)", self.geometry.channels());
        Ok(self.state())
    }

    /// Power-up sequence followed by WAKEUP and SDATAC. POWERED_DOWN -> STANDBY.
    pub fn power_up(&mut self) -> Result<DeviceState, DeviceError> {
        let next = self.state.check(Operation::PowerUp)?;
        let timing = self.timing;

        debug!("Power-up: waiting for supplies and tPOR");
        delay_for(&mut self.delay, timing.power_on_delay);
        delay_for(&mut self.delay, timing.por_delay);

        self.reset
            .set_low()
            .map_err(|e| BusError::Reset(e.kind()))?;
        delay_for(&mut self.delay, timing.reset_pulse_width);
        self.reset
            .set_high()
            .map_err(|e| BusError::Reset(e.kind()))?;
        delay_for(&mut self.delay, timing.reset_settle);
        delay_for(&mut self.delay, timing.stabilize_delay);
        self.state.commit(next);

        self.send_command(Command::Wakeup)?;
        self.send_command(Command::StopContinuous)?;
        info!("ADS1299 powered up, state {}", self.state());
        Ok(self.state())
    }

    /// Issue a single-byte command
    pub fn send_command(&mut self, command: Command) -> Result<DeviceState, DeviceError> {
        let next = self.state.check(Operation::Command(command))?;
        let opcode = encode_command(command);
        self.transact(|spi| spi.write(&[opcode]))?;
        self.state.commit(next);
        delay_for(&mut self.delay, self.timing.command_spacing);
        debug!(
            "Sent {} (0x{:02X}), state {} ({:?})",
            command.mnemonic(),
            opcode,
            self.state(),
            self.phase()
        );
        Ok(self.state())
    }

    pub fn read_register(&mut self, address: impl Into<u8>) -> Result<u8, DeviceError> {
        let mut value = [0u8; 1];
        self.read_registers(address, &mut value)?;
        Ok(value[0])
    }

    /// Burst read of `buf.len()` consecutive registers starting at `start`
    pub fn read_registers(
        &mut self,
        start: impl Into<u8>,
        buf: &mut [u8],
    ) -> Result<(), DeviceError> {
        let prefix = encode_register_read_burst(start.into(), buf.len())?;
        self.state.check(Operation::RegisterAccess)?;
        buf.fill(0);
        self.transact(|spi| {
            spi.write(&prefix)?;
            spi.transfer_in_place(buf)
        })?;
        delay_for(&mut self.delay, self.timing.command_spacing);
        Ok(())
    }

    pub fn write_register(&mut self, address: impl Into<u8>, value: u8) -> Result<(), DeviceError> {
        let address = address.into();
        let bytes = encode_register_write(address, value)?;
        self.state.check(Operation::RegisterAccess)?;
        self.transact(|spi| spi.write(&bytes))?;
        delay_for(&mut self.delay, self.timing.command_spacing);
        trace!("WREG 0x{:02X} = 0x{:02X}", address, value);
        Ok(())
    }

    /// Write a list of register settings in order
    pub fn apply_config(&mut self, config: &[(Register, u8)]) -> Result<(), DeviceError> {
        for &(register, value) in config {
            self.write_register(register, value)?;
            debug!("{:<12} <- 0x{:02X}", register.name(), value);
        }
        Ok(())
    }

    /// Read the whole register map
    pub fn dump_registers(&mut self) -> Result<[u8; REGISTER_COUNT], DeviceError> {
        let mut map = [0u8; REGISTER_COUNT];
        self.read_registers(Register::ID, &mut map)?;
        Ok(map)
    }

    pub fn read_id(&mut self) -> Result<DeviceId, DeviceError> {
        Ok(DeviceId(self.read_register(Register::ID)?))
    }

    /// Read the ID register and check it against the configured geometry
    pub fn verify_id(&mut self) -> Result<DeviceId, DeviceError> {
        let id = self.read_id()?;
        if !id.is_valid() {
            return Err(DeviceError::UnexpectedId(id.0));
        }
        let reported = id
            .channel_count()
            .ok_or(DeviceError::UnexpectedId(id.0))?;
        if reported < self.geometry.channels() {
            return Err(DeviceError::ChannelMismatch {
                reported,
                configured: self.geometry.channels(),
            });
        }
        info!(
            "Device ID 0x{:02X}: {} channels, revision {}",
            id.0,
            reported,
            id.revision()
        );
        Ok(id)
    }

    /// START then RDATAC. Resumes from the converting phase if a previous
    /// attempt failed between the two commands.
    pub fn start_streaming(&mut self) -> Result<DeviceState, DeviceError> {
        if self.phase() != Phase::Converting {
            self.send_command(Command::Start)?;
        }
        self.send_command(Command::ReadContinuous)
    }

    /// STOP then SDATAC. Resumes from the stopping phase if a previous
    /// attempt failed between the two commands.
    pub fn stop_streaming(&mut self) -> Result<DeviceState, DeviceError> {
        if self.phase() != Phase::Stopping {
            self.send_command(Command::Stop)?;
        }
        self.send_command(Command::StopContinuous)
    }

    /// Clock one frame out of the device while streaming
    pub fn read_frame(&mut self) -> Result<RawFrame, DeviceError> {
        self.state.check(Operation::FrameRead)?;
        let mut frame = RawFrame::new(self.geometry);
        let buf = frame.as_mut_bytes();
        self.transact(|spi| spi.transfer_in_place(buf))?;
        trace!("Frame {:02X?}", frame.as_bytes());
        Ok(frame)
    }

    /// RDATA: single-shot frame read while conversions run outside RDATAC
    pub fn read_once(&mut self) -> Result<RawFrame, DeviceError> {
        let next = self.state.check(Operation::Command(Command::ReadOnce))?;
        let mut frame = RawFrame::new(self.geometry);
        let buf = frame.as_mut_bytes();
        let opcode = encode_command(Command::ReadOnce);
        self.transact(|spi| {
            spi.write(&[opcode])?;
            spi.transfer_in_place(buf)
        })?;
        self.state.commit(next);
        Ok(frame)
    }

    /// Run `f` with CS asserted. CS is released even when the transfer fails.
    fn transact<R>(
        &mut self,
        f: impl FnOnce(&mut SPI) -> Result<R, SPI::Error>,
    ) -> Result<R, BusError> {
        self.cs
            .set_low()
            .map_err(|e| BusError::ChipSelect(e.kind()))?;
        let result = f(&mut self.spi).and_then(|value| self.spi.flush().map(|()| value));
        let released = self.cs.set_high();
        let value = result.map_err(|e| BusError::Spi(e.kind()))?;
        released.map_err(|e| BusError::ChipSelect(e.kind()))?;
        Ok(value)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Recording HAL mocks sharing one event log

    use embedded_hal::delay::DelayNs;
    use embedded_hal::digital::{self, ErrorType as PinErrorType, OutputPin};
    use embedded_hal::spi::{self, ErrorType as SpiErrorType, SpiBus};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Event {
        Cs(bool),
        Reset(bool),
        Write(Vec<u8>),
        Transfer(usize),
        DelayNs(u64),
    }

    #[derive(Default)]
    pub struct Shared {
        pub events: Vec<Event>,
        pub responses: VecDeque<Vec<u8>>,
        pub fail_transfers: usize,
    }

    pub type Log = Arc<Mutex<Shared>>;

    pub struct MockSpi(pub Log);
    pub struct MockPin {
        pub log: Log,
        pub is_cs: bool,
    }
    pub struct MockDelay(pub Log);

    impl SpiErrorType for MockSpi {
        type Error = spi::ErrorKind;
    }

    impl SpiBus for MockSpi {
        fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
            self.transfer_in_place(words)
        }

        fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
            self.0.lock().unwrap().events.push(Event::Write(words.to_vec()));
            Ok(())
        }

        fn transfer(&mut self, read: &mut [u8], _write: &[u8]) -> Result<(), Self::Error> {
            self.transfer_in_place(read)
        }

        fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
            let mut shared = self.0.lock().unwrap();
            shared.events.push(Event::Transfer(words.len()));
            if shared.fail_transfers > 0 {
                shared.fail_transfers -= 1;
                return Err(spi::ErrorKind::Overrun);
            }
            if let Some(response) = shared.responses.pop_front() {
                let n = response.len().min(words.len());
                words[..n].copy_from_slice(&response[..n]);
            }
            Ok(())
        }

        fn flush(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    impl PinErrorType for MockPin {
        type Error = digital::ErrorKind;
    }

    impl OutputPin for MockPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.record(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.record(true);
            Ok(())
        }
    }

    impl MockPin {
        fn record(&self, level: bool) {
            let event = if self.is_cs {
                Event::Cs(level)
            } else {
                Event::Reset(level)
            };
            self.log.lock().unwrap().events.push(event);
        }
    }

    impl DelayNs for MockDelay {
        fn delay_ns(&mut self, ns: u32) {
            self.0.lock().unwrap().events.push(Event::DelayNs(ns as u64));
        }

        fn delay_ms(&mut self, ms: u32) {
            self.0
                .lock()
                .unwrap()
                .events
                .push(Event::DelayNs(ms as u64 * 1_000_000));
        }
    }

    pub type MockDevice = super::Ads1299<MockSpi, MockPin, MockPin, MockDelay>;

    pub fn device(channels: usize) -> (MockDevice, Log) {
        let log: Log = Arc::new(Mutex::new(Shared::default()));
        let device = super::Ads1299::new(
            MockSpi(log.clone()),
            MockPin {
                log: log.clone(),
                is_cs: true,
            },
            MockPin {
                log: log.clone(),
                is_cs: false,
            },
            MockDelay(log.clone()),
            crate::nodes::types::FrameGeometry::new(channels).unwrap(),
        );
        (device, log)
    }

    /// Device brought to STANDBY with zero delays and a cleared log
    pub fn standby_device(channels: usize) -> (MockDevice, Log) {
        let (device, log) = device(channels);
        let mut device = device.with_timing(super::PowerUpTiming::immediate());
        device.init().unwrap();
        device.power_up().unwrap();
        log.lock().unwrap().events.clear();
        (device, log)
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{Event, device, standby_device};
    use super::*;

    fn writes(events: &[Event]) -> Vec<Vec<u8>> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Write(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_power_up_sequence_order() {
        let (device, log) = device(8);
        let mut device = device;
        assert_eq!(device.init().unwrap(), DeviceState::PoweredDown);
        assert_eq!(device.power_up().unwrap(), DeviceState::Standby);

        let events = log.lock().unwrap().events.clone();
        let expected = vec![
            Event::Cs(true),
            Event::Reset(true),
            Event::DelayNs(1_000_000_000),
            Event::DelayNs(70_000_000),
            Event::Reset(false),
            Event::DelayNs(10_000),
            Event::Reset(true),
            Event::DelayNs(18_000),
            Event::DelayNs(1_000_000_000),
            Event::Cs(false),
            Event::Write(vec![0x02]),
            Event::Cs(true),
            Event::DelayNs(30_000),
            Event::Cs(false),
            Event::Write(vec![0x11]),
            Event::Cs(true),
            Event::DelayNs(30_000),
        ];
        assert_eq!(events, expected);
    }

    #[test]
    fn test_power_up_requires_init() {
        let (mut device, log) = device(4);
        let err = device.power_up().unwrap_err();
        assert!(matches!(err, DeviceError::IllegalTransition(_)));
        assert!(log.lock().unwrap().events.is_empty());
    }

    #[test]
    fn test_rdatac_in_standby_touches_no_bus() {
        let (mut device, log) = standby_device(4);
        let err = device.send_command(Command::ReadContinuous).unwrap_err();
        match err {
            DeviceError::IllegalTransition(t) => assert_eq!(t.state, DeviceState::Standby),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(log.lock().unwrap().events.is_empty());
        assert_eq!(device.state(), DeviceState::Standby);
    }

    #[test]
    fn test_start_streaming_and_read_frame() {
        let (mut device, log) = standby_device(4);
        assert_eq!(device.start_streaming().unwrap(), DeviceState::Streaming);
        assert_eq!(writes(&log.lock().unwrap().events), vec![vec![0x08], vec![0x10]]);

        let response = vec![0xC0, 0, 0, 0, 0, 1, 0xFF, 0xFF, 0xFF, 0x80, 0, 0, 0x7F, 0xFF, 0xFF];
        log.lock().unwrap().responses.push_back(response.clone());
        let frame = device.read_frame().unwrap();
        assert_eq!(frame.as_bytes(), &response[..]);
        assert!(log.lock().unwrap().events.contains(&Event::Transfer(15)));
    }

    #[test]
    fn test_register_access_rejected_while_streaming() {
        let (mut device, log) = standby_device(8);
        device.start_streaming().unwrap();
        log.lock().unwrap().events.clear();
        assert!(device.read_register(Register::CONFIG1).is_err());
        assert!(device.write_register(Register::CONFIG1, 0x96).is_err());
        assert!(log.lock().unwrap().events.is_empty());
    }

    #[test]
    fn test_failed_transfer_releases_cs_and_keeps_state() {
        let (mut device, log) = standby_device(4);
        device.start_streaming().unwrap();
        log.lock().unwrap().events.clear();
        log.lock().unwrap().fail_transfers = 1;

        let err = device.read_frame().unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Bus(BusError::Spi(spi::ErrorKind::Overrun))
        ));
        let events = log.lock().unwrap().events.clone();
        assert_eq!(events.last(), Some(&Event::Cs(true)));
        assert_eq!(device.state(), DeviceState::Streaming);
    }

    #[test]
    fn test_start_streaming_resumes_after_partial_start() {
        let (mut device, log) = standby_device(4);
        device.send_command(Command::Start).unwrap();
        log.lock().unwrap().fail_transfers = 1;
        assert!(device.read_once().is_err());
        assert_eq!(device.phase(), Phase::Converting);
        assert_eq!(device.start_streaming().unwrap(), DeviceState::Streaming);
        let commands = writes(&log.lock().unwrap().events);
        assert_eq!(commands.iter().filter(|c| c[..] == [0x08]).count(), 1);
    }

    #[test]
    fn test_register_write_and_burst_read() {
        let (mut device, log) = standby_device(8);
        device
            .apply_config(&[(Register::CONFIG1, 0x96), (Register::CONFIG3, 0xE0)])
            .unwrap();
        assert_eq!(
            writes(&log.lock().unwrap().events),
            vec![vec![0x41, 0x00, 0x96], vec![0x43, 0x00, 0xE0]]
        );

        log.lock().unwrap().responses.push_back(vec![0x3E]);
        assert_eq!(device.read_register(Register::ID).unwrap(), 0x3E);

        let mut buf = [0u8; 3];
        log.lock().unwrap().responses.push_back(vec![0x12, 0x34, 0x56]);
        device.read_registers(Register::LOFF_STATP, &mut buf).unwrap();
        assert_eq!(buf, [0x12, 0x34, 0x56]);
        assert!(log.lock().unwrap().events.contains(&Event::Write(vec![0x32, 0x02])));
    }

    #[test]
    fn test_verify_id() {
        let (mut device, log) = standby_device(8);
        log.lock().unwrap().responses.push_back(vec![0x3E]);
        let id = device.verify_id().unwrap();
        assert_eq!(id.channel_count(), Some(8));

        log.lock().unwrap().responses.push_back(vec![0x3C]);
        assert!(matches!(
            device.verify_id(),
            Err(DeviceError::ChannelMismatch { reported: 4, configured: 8 })
        ));

        log.lock().unwrap().responses.push_back(vec![0x00]);
        assert!(matches!(device.verify_id(), Err(DeviceError::UnexpectedId(0))));
    }

    #[test]
    fn test_stop_streaming_returns_to_standby() {
        let (mut device, log) = standby_device(4);
        device.start_streaming().unwrap();
        log.lock().unwrap().events.clear();
        assert_eq!(device.stop_streaming().unwrap(), DeviceState::Standby);
        assert_eq!(writes(&log.lock().unwrap().events), vec![vec![0x0A], vec![0x11]]);
        assert!(device.read_frame().is_err());
    }
}
