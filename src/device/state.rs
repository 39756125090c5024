//! Device lifecycle state machine
//!
//! The externally visible [`DeviceState`] is refined by an internal phase so
//! that two-command transitions (START then RDATAC, STOP then SDATAC) and the
//! power-up handshake (reset pulse, WAKEUP, SDATAC) can be validated one bus
//! operation at a time. Every operation is checked before the bus is touched
//! and committed only after the bus operation succeeded.

use super::registers::Command;
use std::fmt;
use thiserror::Error;

/// Externally visible device state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Uninitialized,
    PoweredDown,
    Standby,
    Streaming,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Uninitialized => "UNINITIALIZED",
            DeviceState::PoweredDown => "POWERED_DOWN",
            DeviceState::Standby => "STANDBY",
            DeviceState::Streaming => "STREAMING",
        };
        f.write_str(name)
    }
}

/// Sub-state inside a [`DeviceState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    /// Reset pulse (or RESET command) issued, waiting for the follow-up
    Reset,
    /// WAKEUP issued after power-up, SDATAC pending
    Woken,
    /// START issued, conversions running
    Converting,
    /// STOP issued while streaming, SDATAC pending
    Stopping,
    /// STANDBY command issued
    LowPower,
}

/// Operations the state machine arbitrates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ReadinessCheck,
    PowerUp,
    Command(Command),
    RegisterAccess,
    FrameRead,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::ReadinessCheck => f.write_str("readiness check"),
            Operation::PowerUp => f.write_str("power-up"),
            Operation::Command(command) => f.write_str(command.mnemonic()),
            Operation::RegisterAccess => f.write_str("register access"),
            Operation::FrameRead => f.write_str("frame read"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{operation} is not allowed in state {state} ({phase:?})")]
pub struct IllegalTransition {
    pub operation: Operation,
    pub state: DeviceState,
    pub phase: Phase,
}

/// Single-writer lifecycle tracker owned by the driver
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: DeviceState,
    phase: Phase,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: DeviceState::Uninitialized,
            phase: Phase::Idle,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Validate `operation` and return the state it leads to, without committing
    pub fn check(&self, operation: Operation) -> Result<(DeviceState, Phase), IllegalTransition> {
        use Command as C;
        use DeviceState as S;
        use Operation as O;
        use Phase as P;

        let next = match (self.state, self.phase, operation) {
            (S::Uninitialized, _, O::ReadinessCheck) => Some((S::PoweredDown, P::Idle)),
            (S::PoweredDown, P::Idle, O::PowerUp) => Some((S::PoweredDown, P::Reset)),
            (S::PoweredDown, P::Reset, O::Command(C::Wakeup)) => Some((S::PoweredDown, P::Woken)),
            (S::PoweredDown, P::Woken, O::Command(C::StopContinuous)) => Some((S::Standby, P::Idle)),

            (S::Standby, P::Idle, O::Command(C::Start)) => Some((S::Standby, P::Converting)),
            (S::Standby, P::Idle, O::Command(C::Standby)) => Some((S::Standby, P::LowPower)),
            (S::Standby, P::LowPower, O::Command(C::Wakeup)) => Some((S::Standby, P::Idle)),
            (S::Standby, P::Idle, O::Command(C::Reset)) => Some((S::Standby, P::Reset)),
            (S::Standby, P::Reset, O::Command(C::StopContinuous)) => Some((S::Standby, P::Idle)),
            (S::Standby, P::Converting, O::Command(C::ReadContinuous)) => {
                Some((S::Streaming, P::Idle))
            }
            (S::Standby, P::Converting, O::Command(C::Stop)) => Some((S::Standby, P::Idle)),
            (S::Standby, P::Converting, O::Command(C::ReadOnce)) => {
                Some((S::Standby, P::Converting))
            }
            (S::Standby, P::Idle | P::Converting, O::RegisterAccess) => {
                Some((self.state, self.phase))
            }

            (S::Streaming, P::Idle, O::FrameRead) => Some((S::Streaming, P::Idle)),
            (S::Streaming, P::Idle, O::Command(C::Stop)) => Some((S::Streaming, P::Stopping)),
            (S::Streaming, P::Stopping, O::Command(C::StopContinuous)) => {
                Some((S::Standby, P::Idle))
            }

            _ => None,
        };

        next.ok_or(IllegalTransition {
            operation,
            state: self.state,
            phase: self.phase,
        })
    }

    /// Record a transition previously returned by [`check`](Self::check)
    pub fn commit(&mut self, next: (DeviceState, Phase)) {
        self.state = next.0;
        self.phase = next.1;
    }

    /// Check and commit in one step, for operations without bus traffic
    pub fn apply(&mut self, operation: Operation) -> Result<DeviceState, IllegalTransition> {
        let next = self.check(operation)?;
        self.commit(next);
        Ok(self.state)
    }

    pub fn can_access_registers(&self) -> bool {
        self.check(Operation::RegisterAccess).is_ok()
    }

    pub fn can_read_frames(&self) -> bool {
        self.check(Operation::FrameRead).is_ok()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
