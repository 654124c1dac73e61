use thiserror::Error;

use crate::pins::Role;
use crate::signal::PinId;

/// Faults detected by an engine while relaying. Every fault is local to the
/// engine that saw it; none of them is ever carried across the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("frame timed out after {bits} of {expected} bits")]
    FrameTimeout { bits: u8, expected: u8 },
    #[error("protocol violation: {0}")]
    ProtocolViolation(Violation),
    #[error("isolator enable asserted by both sides")]
    BusContention,
    #[error("keyboard did not acknowledge")]
    AckTimeout,
    #[error("address index {index} is outside the table of {len} entries")]
    AddressRejected { index: usize, len: usize },
    #[error("value {value:#04x} does not fit in {bits} data bits")]
    ValueTooWide { value: u8, bits: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("parity bit mismatch")]
    Parity,
    #[error("stop bit was low")]
    StopBit,
    #[error("request line released mid-frame")]
    RequestWithdrawn,
}

impl From<Violation> for RelayError {
    fn from(violation: Violation) -> Self {
        RelayError::ProtocolViolation(violation)
    }
}

/// Configuration rejected before any engine is built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown pin role {0:?}")]
    UnknownRole(String),
    #[error("no pin bound for {0}")]
    MissingPin(Role),
    #[error("pin {pin} bound to both {first} and {second}")]
    PinConflict { pin: PinId, first: Role, second: Role },
    #[error("address table is empty")]
    EmptyAddressTable,
    #[error("address table holds {0} entries, at most 4 allowed")]
    AddressTableTooLarge(usize),
    #[error("address {0:#04x} listed twice")]
    DuplicateAddress(u8),
    #[error("invalid codec: {0}")]
    Codec(String),
    #[error("invalid {segment} timing: {reason}")]
    Timing {
        segment: &'static str,
        reason: &'static str,
    },
}
