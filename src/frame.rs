use std::fmt;

use crate::signal::Micros;

/// Direction a frame travels through the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    KeyboardToHost,
    HostToKeyboard,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::KeyboardToHost => write!(f, "kbd->host"),
            Direction::HostToKeyboard => write!(f, "host->kbd"),
        }
    }
}

/// Raw bits of one transfer, in arrival order (bit 0 arrived first).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BitFrame {
    pub direction: Direction,
    bits: u16,
    len: u8,
    pub started_at: Micros,
    pub last_edge: Micros,
}

impl BitFrame {
    pub const CAPACITY: u8 = 16;

    pub fn new(direction: Direction, at: Micros) -> Self {
        Self {
            direction,
            bits: 0,
            len: 0,
            started_at: at,
            last_edge: at,
        }
    }

    pub fn push(&mut self, bit: bool, at: Micros) {
        debug_assert!(self.len < Self::CAPACITY, "bit frame overflow");
        self.bits |= (bit as u16) << self.len;
        self.len += 1;
        self.last_edge = at;
    }

    /// Record an edge that carried no bit, keeping the frame alive.
    pub fn touch(&mut self, at: Micros) {
        self.last_edge = at;
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bit(&self, index: u8) -> bool {
        index < self.len && (self.bits >> index) & 1 == 1
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(|i| self.bit(i))
    }
}

impl fmt::Debug for BitFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitFrame({} ", self.direction)?;
        for bit in self.iter() {
            write!(f, "{}", bit as u8)?;
        }
        write!(f, " @{})", self.started_at)
    }
}
