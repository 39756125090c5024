//! ADS1299 device access: bus framing, lifecycle state and the driver

pub mod driver;
pub mod registers;
pub mod state;
pub mod timing;

pub use driver::{Ads1299, BusError, DeviceError, DeviceId};
pub use registers::{Command, FramingError, Register, RegisterCommand};
pub use state::{DeviceState, IllegalTransition, Operation, Phase};
pub use timing::PowerUpTiming;
