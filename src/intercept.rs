//! The interception hook: the one place where relayed bytes may be altered.

use std::collections::{HashMap, HashSet};

use crate::frame::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Forward,
    Modify(u8),
    Suppress,
}

impl Decision {
    /// Byte to relay for `original`, or `None` when suppressed.
    pub fn apply(self, original: u8) -> Option<u8> {
        match self {
            Decision::Forward => Some(original),
            Decision::Modify(byte) => Some(byte),
            Decision::Suppress => None,
        }
    }
}

pub trait InterceptionPolicy {
    fn intercept(&mut self, direction: Direction, address: u8, byte: u8) -> Decision;
}

impl<F> InterceptionPolicy for F
where
    F: FnMut(Direction, u8, u8) -> Decision,
{
    fn intercept(&mut self, direction: Direction, address: u8, byte: u8) -> Decision {
        self(direction, address, byte)
    }
}

/// Transparent relay.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl InterceptionPolicy for Passthrough {
    fn intercept(&mut self, _: Direction, _: u8, _: u8) -> Decision {
        Decision::Forward
    }
}

/// Byte remapping and filtering, optionally limited to one address.
#[derive(Debug, Default, Clone)]
pub struct Remap {
    map: HashMap<(Direction, u8), u8>,
    suppress: HashSet<(Direction, u8)>,
    address: Option<u8>,
}

impl Remap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(mut self, direction: Direction, from: u8, to: u8) -> Self {
        self.map.insert((direction, from), to);
        self
    }

    pub fn suppress(mut self, direction: Direction, byte: u8) -> Self {
        self.suppress.insert((direction, byte));
        self
    }

    /// Only act while `address` is selected; forward everything else.
    pub fn only_for(mut self, address: u8) -> Self {
        self.address = Some(address);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty() && self.suppress.is_empty()
    }
}

impl InterceptionPolicy for Remap {
    fn intercept(&mut self, direction: Direction, address: u8, byte: u8) -> Decision {
        if self.address.is_some_and(|a| a != address) {
            return Decision::Forward;
        }
        if self.suppress.contains(&(direction, byte)) {
            return Decision::Suppress;
        }
        match self.map.get(&(direction, byte)) {
            Some(&to) => Decision::Modify(to),
            None => Decision::Forward,
        }
    }
}
