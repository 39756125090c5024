//! Bus framing for the ADS1299 command set
//!
//! Pure encoders that turn commands and register accesses into the bytes
//! clocked out on MOSI. Nothing here touches the bus or the device state.

use thiserror::Error;

/// Highest valid register address
pub const LAST_REGISTER: u8 = 0x17;

/// Number of addressable registers
pub const REGISTER_COUNT: usize = LAST_REGISTER as usize + 1;

const RREG: u8 = 0x20;
const WREG: u8 = 0x40;

/// Errors produced while framing a bus transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("Register address 0x{0:02X} is outside 0x00..=0x17")]
    InvalidAddress(u8),

    #[error("Register burst of {count} from 0x{address:02X} is invalid")]
    InvalidCount { address: u8, count: usize },
}

/// Single-byte system and data commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Wakeup = 0x02,
    Standby = 0x04,
    Reset = 0x06,
    Start = 0x08,
    Stop = 0x0A,
    /// RDATAC
    ReadContinuous = 0x10,
    /// SDATAC
    StopContinuous = 0x11,
    /// RDATA
    ReadOnce = 0x12,
}

impl Command {
    pub const ALL: [Command; 8] = [
        Command::Wakeup,
        Command::Standby,
        Command::Reset,
        Command::Start,
        Command::Stop,
        Command::ReadContinuous,
        Command::StopContinuous,
        Command::ReadOnce,
    ];

    pub fn opcode(self) -> u8 {
        self as u8
    }

    /// Decode an opcode byte back into a command
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.opcode() == opcode)
    }

    /// Datasheet mnemonic
    pub fn mnemonic(self) -> &'static str {
        match self {
            Command::Wakeup => "WAKEUP",
            Command::Standby => "STANDBY",
            Command::Reset => "RESET",
            Command::Start => "START",
            Command::Stop => "STOP",
            Command::ReadContinuous => "RDATAC",
            Command::StopContinuous => "SDATAC",
            Command::ReadOnce => "RDATA",
        }
    }
}

macro_rules! registers {
    (
        $enum_name:ident, $slice_name:ident {
            $($name:ident = $val:expr),* $(,)?
        }
    ) => {
        #[repr(u8)]
        #[allow(non_camel_case_types)]
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub enum $enum_name {
            $($name = $val),*
        }

        pub const $slice_name: &[$enum_name] = &[
            $($enum_name::$name),*
        ];

        impl $enum_name {
            pub fn name(&self) -> &'static str {
                match self {
                    $($enum_name::$name => stringify!($name),)*
                }
            }

            pub fn addr(self) -> u8 {
                self as u8
            }

            pub fn from_addr(addr: u8) -> Option<Self> {
                $slice_name.iter().copied().find(|r| r.addr() == addr)
            }
        }

        impl From<$enum_name> for u8 {
            fn from(r: $enum_name) -> u8 {
                r as u8
            }
        }
    };
}

registers!(Register, REGISTERS {
    ID = 0x00,
    CONFIG1 = 0x01,
    CONFIG2 = 0x02,
    CONFIG3 = 0x03,
    LOFF = 0x04,
    CH1SET = 0x05,
    CH2SET = 0x06,
    CH3SET = 0x07,
    CH4SET = 0x08,
    CH5SET = 0x09,
    CH6SET = 0x0A,
    CH7SET = 0x0B,
    CH8SET = 0x0C,
    BIAS_SENSP = 0x0D,
    BIAS_SENSN = 0x0E,
    LOFF_SENSP = 0x0F,
    LOFF_SENSN = 0x10,
    LOFF_FLIP = 0x11,
    LOFF_STATP = 0x12,
    LOFF_STATN = 0x13,
    GPIO = 0x14,
    MISC1 = 0x15,
    MISC2 = 0x16,
    CONFIG4 = 0x17,
});

impl Register {
    /// Channel settings register for a 1-based channel number
    pub fn channel_set(channel: u8) -> Option<Self> {
        match channel {
            1..=8 => Self::from_addr(Register::CH1SET.addr() + channel - 1),
            _ => None,
        }
    }
}

fn check_address(address: u8) -> Result<u8, FramingError> {
    if address > LAST_REGISTER {
        return Err(FramingError::InvalidAddress(address));
    }
    Ok(address)
}

pub fn encode_command(command: Command) -> u8 {
    command.opcode()
}

/// `[RREG | addr, 0x00]`, one register
pub fn encode_register_read(address: u8) -> Result<[u8; 2], FramingError> {
    encode_register_read_burst(address, 1)
}

/// `[RREG | addr, count - 1]`, reading `count` consecutive registers
pub fn encode_register_read_burst(address: u8, count: usize) -> Result<[u8; 2], FramingError> {
    let address = check_address(address)?;
    let last = address as usize + count;
    if count == 0 || last > REGISTER_COUNT {
        return Err(FramingError::InvalidCount { address, count });
    }
    Ok([RREG | address, (count - 1) as u8])
}

/// `[WREG | addr, 0x00, value]`, writing one register
pub fn encode_register_write(address: u8, value: u8) -> Result<[u8; 3], FramingError> {
    let address = check_address(address)?;
    Ok([WREG | address, 0x00, value])
}

/// A framed bus transaction prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterCommand {
    Command(Command),
    Read { address: u8, count: usize },
    Write { address: u8, value: u8 },
}

/// Encoded bytes of a [`RegisterCommand`], stored inline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedCommand {
    bytes: [u8; 3],
    len: usize,
}

impl EncodedCommand {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl RegisterCommand {
    pub fn encode(&self) -> Result<EncodedCommand, FramingError> {
        let encoded = match *self {
            RegisterCommand::Command(command) => EncodedCommand {
                bytes: [encode_command(command), 0, 0],
                len: 1,
            },
            RegisterCommand::Read { address, count } => {
                let [a, b] = encode_register_read_burst(address, count)?;
                EncodedCommand {
                    bytes: [a, b, 0],
                    len: 2,
                }
            }
            RegisterCommand::Write { address, value } => EncodedCommand {
                bytes: encode_register_write(address, value)?,
                len: 3,
            },
        };
        Ok(encoded)
    }
}
