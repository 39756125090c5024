//! Simulated ADS1299 for host runs and tests
//!
//! [`SimulatedChip`] models the part of the chip the driver talks to: the
//! command decoder, RREG/WREG register access, RDATAC and RDATA frame output,
//! the RESET pin and the DRDY timing. It hands out `embedded-hal` handles
//! ([`SimBus`], [`SimPin`], [`SimDelay`]) that share one model, plus a
//! [`SimDataReady`] edge source paced at the configured sample rate.

use crate::device::registers::{Command, LAST_REGISTER, REGISTER_COUNT, Register};
use crate::device::{Ads1299, PowerUpTiming};
use crate::nodes::drdy::DataReadyLine;
use crate::nodes::types::{BYTES_PER_CHANNEL, FrameGeometry, MAX_FRAME_BYTES, STATUS_BYTES};
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{self, ErrorType as PinErrorType, OutputPin};
use embedded_hal::spi::{self, ErrorType as SpiErrorType, SpiBus};
use std::convert::Infallible;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Value of channel `channel` (0-based) for conversion number `index`
pub type SignalFn = Box<dyn FnMut(u64, usize) -> i32 + Send>;

/// Byte-level parser state inside one CS window
#[derive(Debug, Clone, Copy)]
enum Parse {
    Opcode,
    ReadCount { address: u8 },
    Read { address: u8, remaining: usize },
    WriteCount { address: u8 },
    Write { address: u8, remaining: usize },
    Frame { pos: usize },
}

struct ChipModel {
    channels: usize,
    registers: [u8; REGISTER_COUNT],
    signal: SignalFn,
    parse: Parse,
    frame: [u8; MAX_FRAME_BYTES],
    frame_len: usize,
    cs_active: bool,
    reset_low: bool,
    low_power: bool,
    converting: bool,
    continuous: bool,
    rdata_pending: bool,
    conversions: u64,
    fail_transfers: usize,
    commands: Vec<Command>,
    frames_clocked: u64,
    unselected_transfers: u64,
    resets: u64,
}

fn default_signal() -> SignalFn {
    // 10 Hz sine at 250 SPS with a per-channel DC offset
    Box::new(|index, channel| {
        let t = index as f64 / 250.0;
        let offset = 1_000 * (channel as i32 + 1);
        offset + (100_000.0 * (TAU * 10.0 * t).sin()) as i32
    })
}

fn id_for(channels: usize) -> u8 {
    match channels {
        0..=4 => 0x3C,
        5..=6 => 0x3D,
        _ => 0x3E,
    }
}

impl ChipModel {
    fn new(channels: usize) -> Self {
        let mut model = Self {
            channels,
            registers: [0; REGISTER_COUNT],
            signal: default_signal(),
            parse: Parse::Opcode,
            frame: [0; MAX_FRAME_BYTES],
            frame_len: 0,
            cs_active: false,
            reset_low: false,
            low_power: false,
            converting: false,
            continuous: true,
            rdata_pending: false,
            conversions: 0,
            fail_transfers: 0,
            commands: Vec::new(),
            frames_clocked: 0,
            unselected_transfers: 0,
            resets: 0,
        };
        model.reset();
        model
    }

    /// Power-on / RESET defaults: registers restored, RDATAC mode, not converting
    fn reset(&mut self) {
        self.registers = [0; REGISTER_COUNT];
        self.registers[Register::ID.addr() as usize] = id_for(self.channels);
        self.registers[Register::CONFIG1.addr() as usize] = 0x96;
        self.registers[Register::CONFIG2.addr() as usize] = 0xC0;
        self.registers[Register::CONFIG3.addr() as usize] = 0x60;
        for channel in 1..=8u8 {
            if let Some(register) = Register::channel_set(channel) {
                self.registers[register.addr() as usize] = 0x61;
            }
        }
        self.parse = Parse::Opcode;
        self.low_power = false;
        self.converting = false;
        self.continuous = true;
        self.rdata_pending = false;
        self.resets += 1;
    }

    fn latch_frame(&mut self) {
        self.frame = [0; MAX_FRAME_BYTES];
        // 1100 | LOFF_STATP | LOFF_STATN | GPIO[7:4]
        let statp = self.registers[Register::LOFF_STATP.addr() as usize] as u32;
        let statn = self.registers[Register::LOFF_STATN.addr() as usize] as u32;
        let gpio = (self.registers[Register::GPIO.addr() as usize] >> 4) as u32;
        let status = (0b1100 << 20) | (statp << 12) | (statn << 4) | gpio;
        self.frame[..STATUS_BYTES].copy_from_slice(&status.to_be_bytes()[1..]);

        for channel in 0..self.channels {
            let value = (self.signal)(self.conversions, channel).clamp(-(1 << 23), (1 << 23) - 1);
            let offset = STATUS_BYTES + BYTES_PER_CHANNEL * channel;
            self.frame[offset..offset + BYTES_PER_CHANNEL].copy_from_slice(&value.to_be_bytes()[1..]);
        }
        self.frame_len = STATUS_BYTES + BYTES_PER_CHANNEL * self.channels;
        self.conversions += 1;
        self.frames_clocked += 1;
        self.rdata_pending = false;
    }

    fn apply_command(&mut self, command: Command) {
        trace!("sim: {}", command.mnemonic());
        self.commands.push(command);
        match command {
            Command::Wakeup => self.low_power = false,
            Command::Standby => self.low_power = true,
            Command::Reset => self.reset(),
            Command::Start => self.converting = true,
            Command::Stop => self.converting = false,
            Command::ReadContinuous => self.continuous = true,
            Command::StopContinuous => self.continuous = false,
            Command::ReadOnce => self.rdata_pending = true,
        }
    }

    fn frame_ready(&self) -> bool {
        self.converting && !self.low_power && (self.continuous || self.rdata_pending)
    }

    /// Clock one byte: `tx` in on MOSI, returned value out on MISO
    fn clock(&mut self, tx: u8) -> u8 {
        match self.parse {
            Parse::Opcode => {
                if tx == 0x00 && self.frame_ready() {
                    self.latch_frame();
                    self.parse = Parse::Frame { pos: 0 };
                    return self.clock(tx);
                }
                match tx {
                    0x20..=0x3F => {
                        self.parse = Parse::ReadCount {
                            address: tx & 0x1F,
                        }
                    }
                    0x40..=0x5F => {
                        self.parse = Parse::WriteCount {
                            address: tx & 0x1F,
                        }
                    }
                    _ => {
                        if let Some(command) = Command::from_opcode(tx) {
                            self.apply_command(command);
                        }
                    }
                }
                0
            }
            Parse::ReadCount { address } => {
                self.parse = Parse::Read {
                    address,
                    remaining: tx as usize + 1,
                };
                0
            }
            Parse::Read { address, remaining } => {
                let value = self.register(address);
                self.parse = if remaining > 1 {
                    Parse::Read {
                        address: address.wrapping_add(1),
                        remaining: remaining - 1,
                    }
                } else {
                    Parse::Opcode
                };
                value
            }
            Parse::WriteCount { address } => {
                self.parse = Parse::Write {
                    address,
                    remaining: tx as usize + 1,
                };
                0
            }
            Parse::Write { address, remaining } => {
                self.write_register(address, tx);
                self.parse = if remaining > 1 {
                    Parse::Write {
                        address: address.wrapping_add(1),
                        remaining: remaining - 1,
                    }
                } else {
                    Parse::Opcode
                };
                0
            }
            Parse::Frame { pos } => {
                let value = if pos < self.frame_len { self.frame[pos] } else { 0 };
                self.parse = if pos + 1 < self.frame_len {
                    Parse::Frame { pos: pos + 1 }
                } else {
                    Parse::Opcode
                };
                value
            }
        }
    }

    fn register(&self, address: u8) -> u8 {
        if address > LAST_REGISTER {
            return 0;
        }
        self.registers[address as usize]
    }

    fn write_register(&mut self, address: u8, value: u8) {
        let read_only = [
            Register::ID.addr(),
            Register::LOFF_STATP.addr(),
            Register::LOFF_STATN.addr(),
        ];
        if address > LAST_REGISTER || read_only.contains(&address) {
            return;
        }
        self.registers[address as usize] = value;
    }
}

type Shared = Arc<Mutex<ChipModel>>;

fn lock(model: &Shared) -> MutexGuard<'_, ChipModel> {
    model.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A simulated device; clone-free handles share its state
pub struct SimulatedChip {
    model: Shared,
    hold: Arc<AtomicBool>,
}

impl SimulatedChip {
    /// Chip with `channels` inputs (4, 6 or 8 in the real family)
    pub fn new(channels: usize) -> Self {
        Self {
            model: Arc::new(Mutex::new(ChipModel::new(channels))),
            hold: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn bus(&self) -> SimBus {
        SimBus {
            model: Arc::clone(&self.model),
            hold: Arc::clone(&self.hold),
        }
    }

    pub fn chip_select(&self) -> SimPin {
        SimPin {
            model: Arc::clone(&self.model),
            role: PinRole::ChipSelect,
        }
    }

    pub fn reset_pin(&self) -> SimPin {
        SimPin {
            model: Arc::clone(&self.model),
            role: PinRole::Reset,
        }
    }

    pub fn delay(&self) -> SimDelay {
        SimDelay::default()
    }

    /// Data-ready edges at `rate_hz` while conversions run
    pub fn data_ready(&self, rate_hz: f64) -> SimDataReady {
        SimDataReady {
            model: Arc::clone(&self.model),
            period: Duration::from_secs_f64(1.0 / rate_hz.max(1e-3)),
            next_edge: None,
            edges: 0,
            edge_limit: None,
            fail_after: None,
        }
    }

    /// Driver wired to this chip, with zero power-up delays
    pub fn device(&self, geometry: FrameGeometry) -> Ads1299<SimBus, SimPin, SimPin, SimDelay> {
        Ads1299::new(
            self.bus(),
            self.chip_select(),
            self.reset_pin(),
            self.delay(),
            geometry,
        )
        .with_timing(PowerUpTiming::immediate())
    }

    pub fn set_signal(&self, signal: impl FnMut(u64, usize) -> i32 + Send + 'static) {
        lock(&self.model).signal = Box::new(signal);
    }

    /// While set, every SPI transfer blocks until it is cleared
    pub fn hold_transfers(&self, hold: bool) {
        self.hold.store(hold, Ordering::Release);
    }

    /// Make the next `count` SPI transfers fail
    pub fn fail_next_transfers(&self, count: usize) {
        lock(&self.model).fail_transfers = count;
    }

    pub fn set_register(&self, register: Register, value: u8) {
        lock(&self.model).registers[register.addr() as usize] = value;
    }

    pub fn register(&self, register: Register) -> u8 {
        lock(&self.model).register(register.addr())
    }

    pub fn commands(&self) -> Vec<Command> {
        lock(&self.model).commands.clone()
    }

    pub fn is_converting(&self) -> bool {
        lock(&self.model).converting
    }

    pub fn is_continuous(&self) -> bool {
        lock(&self.model).continuous
    }

    pub fn frames_clocked(&self) -> u64 {
        lock(&self.model).frames_clocked
    }

    /// Transfers attempted with CS de-asserted
    pub fn unselected_transfers(&self) -> u64 {
        lock(&self.model).unselected_transfers
    }

    /// Reset count, including the power-on reset
    pub fn resets(&self) -> u64 {
        lock(&self.model).resets
    }
}

/// SPI handle into the simulated chip
pub struct SimBus {
    model: Shared,
    hold: Arc<AtomicBool>,
}

impl SimBus {
    fn exchange(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), spi::ErrorKind> {
        while self.hold.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
        }
        let mut model = lock(&self.model);
        if model.fail_transfers > 0 {
            model.fail_transfers -= 1;
            return Err(spi::ErrorKind::Other);
        }
        let len = read.len().max(write.len());
        if !model.cs_active {
            model.unselected_transfers += 1;
            read.fill(0);
            return Ok(());
        }
        for i in 0..len {
            let rx = model.clock(write.get(i).copied().unwrap_or(0));
            if let Some(slot) = read.get_mut(i) {
                *slot = rx;
            }
        }
        Ok(())
    }
}

impl SpiErrorType for SimBus {
    type Error = spi::ErrorKind;
}

impl SpiBus for SimBus {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.exchange(words, &[])
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        self.exchange(&mut [], words)
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        self.exchange(read, write)
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        let tx = words.to_vec();
        self.exchange(words, &tx)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PinRole {
    ChipSelect,
    Reset,
}

/// CS or RESET line into the simulated chip, both active low
pub struct SimPin {
    model: Shared,
    role: PinRole,
}

impl PinErrorType for SimPin {
    type Error = Infallible;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        let mut model = lock(&self.model);
        match self.role {
            PinRole::ChipSelect => {
                model.cs_active = true;
                model.parse = Parse::Opcode;
            }
            PinRole::Reset => model.reset_low = true,
        }
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        let mut model = lock(&self.model);
        match self.role {
            PinRole::ChipSelect => {
                model.cs_active = false;
                model.parse = Parse::Opcode;
            }
            PinRole::Reset => {
                if model.reset_low {
                    debug!("sim: reset pulse");
                    model.reset();
                }
                model.reset_low = false;
            }
        }
        Ok(())
    }
}

/// Delay that records the requested time, optionally sleeping for real
#[derive(Debug, Default)]
pub struct SimDelay {
    total: Duration,
    real_time: bool,
}

impl SimDelay {
    pub fn real_time() -> Self {
        Self {
            total: Duration::ZERO,
            real_time: true,
        }
    }

    /// Sum of every delay requested so far
    pub fn total(&self) -> Duration {
        self.total
    }
}

impl DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        let duration = Duration::from_nanos(ns as u64);
        self.total += duration;
        if self.real_time {
            thread::sleep(duration);
        }
    }
}

/// DRDY edges paced at the sample rate while the chip converts
pub struct SimDataReady {
    model: Shared,
    period: Duration,
    next_edge: Option<Instant>,
    edges: u64,
    edge_limit: Option<u64>,
    fail_after: Option<u64>,
}

impl SimDataReady {
    /// Stop producing edges after `limit` of them
    pub fn with_edge_limit(mut self, limit: u64) -> Self {
        self.edge_limit = Some(limit);
        self
    }

    /// Report a line failure once `edges` edges were delivered
    pub fn with_failure_after(mut self, edges: u64) -> Self {
        self.fail_after = Some(edges);
        self
    }

    pub fn edges(&self) -> u64 {
        self.edges
    }
}

impl DataReadyLine for SimDataReady {
    fn poll_edge(&mut self, timeout: Duration) -> Result<bool, digital::ErrorKind> {
        if self.fail_after.is_some_and(|n| self.edges >= n) {
            return Err(digital::ErrorKind::Other);
        }
        let exhausted = self.edge_limit.is_some_and(|n| self.edges >= n);
        let converting = lock(&self.model).converting;
        if exhausted || !converting {
            self.next_edge = None;
            thread::sleep(timeout);
            return Ok(false);
        }

        let now = Instant::now();
        let next = *self.next_edge.get_or_insert(now + self.period);
        if next > now + timeout {
            thread::sleep(timeout);
            return Ok(false);
        }
        thread::sleep(next.saturating_duration_since(now));
        // Fall behind rather than burst when the consumer of edges is late
        self.next_edge = Some((next + self.period).max(Instant::now()));
        self.edges += 1;
        Ok(true)
    }
}
