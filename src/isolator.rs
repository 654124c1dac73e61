//! Arbitration of the isolator enable line.
//!
//! The right to raise isolator-enable is an [`IsolatorToken`]. Exactly one
//! exists; it moves out of the [`Isolator`] to the engine that transmits and
//! back again when the handoff completes, so both sides can never drive the
//! line at the same time.

use tracing::{debug, trace};

use crate::error::RelayError;
use crate::signal::{Drive, Level, PinId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Keyboard processor (upstream engine).
    Keyboard,
    /// Machine feeder (downstream engine).
    Machine,
}

/// Permission to drive isolator-enable. Deliberately neither `Clone` nor
/// `Copy`.
#[derive(Debug, PartialEq, Eq)]
pub struct IsolatorToken {
    holder: Side,
    pin: PinId,
}

impl IsolatorToken {
    pub fn holder(&self) -> Side {
        self.holder
    }

    /// The holder's own isolator-enable pin.
    pub fn pin(&self) -> PinId {
        self.pin
    }
}

#[derive(Debug, Default)]
pub struct Isolator {
    holder: Option<Side>,
    handoffs: usize,
}

impl Isolator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the token for the engine whose isolator-enable pin is `pin`. The
    /// holder's transmitter raises the line.
    pub fn acquire(&mut self, side: Side, pin: PinId) -> Result<IsolatorToken, RelayError> {
        if let Some(holder) = self.holder {
            debug!("ISO: {side:?} denied, held by {holder:?}");
            return Err(RelayError::BusContention);
        }
        trace!("ISO: {side:?} acquired");
        self.holder = Some(side);
        Ok(IsolatorToken { holder: side, pin })
    }

    /// Return the token and drain the line.
    pub fn release(&mut self, token: IsolatorToken) -> Drive {
        debug_assert_eq!(self.holder, Some(token.holder));
        trace!("ISO: {:?} released", token.holder);
        self.holder = None;
        self.handoffs += 1;
        Drive {
            pin: token.pin,
            level: Level::Low,
        }
    }

    /// Read-only "link active" view.
    pub fn is_active(&self) -> bool {
        self.holder.is_some()
    }

    pub fn holder(&self) -> Option<Side> {
        self.holder
    }

    /// Completed acquire/release pairs.
    pub fn handoffs(&self) -> usize {
        self.handoffs
    }
}
