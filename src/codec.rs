//! Bit-level framing shared by every segment of the bridge.
//!
//! The legacy keyboard protocol's bit order, clock polarity and framing bits
//! come from the target hardware, so none of them is defaulted here: each
//! segment carries an explicit [`BitCodec`].

use std::fmt;
use std::str::FromStr;

use crate::error::{ConfigError, RelayError, Violation};
use crate::frame::{BitFrame, Direction};
use crate::signal::Edge;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOrder {
    LsbFirst,
    MsbFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl Parity {
    /// Parity bit to append after `data`, if any.
    fn bit_for(self, data: u8) -> Option<bool> {
        let odd_ones = data.count_ones() % 2 == 1;
        match self {
            Parity::None => None,
            Parity::Even => Some(odd_ones),
            Parity::Odd => Some(!odd_ones),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitCodec {
    pub bit_order: BitOrder,
    /// Edge on which the receiver samples the data line.
    pub clock_edge: Edge,
    pub parity: Parity,
    /// Trailing framing bit that must read high.
    pub stop_bit: bool,
    pub data_bits: u8,
}

impl BitCodec {
    pub fn new(bit_order: BitOrder, clock_edge: Edge, parity: Parity) -> Self {
        Self {
            bit_order,
            clock_edge,
            parity,
            stop_bit: false,
            data_bits: 8,
        }
    }

    pub fn with_stop_bit(mut self) -> Self {
        self.stop_bit = true;
        self
    }

    pub fn with_data_bits(mut self, data_bits: u8) -> Result<Self, ConfigError> {
        if !(1..=8).contains(&data_bits) {
            return Err(ConfigError::Codec(format!(
                "{data_bits} data bits, expected 1..=8"
            )));
        }
        self.data_bits = data_bits;
        Ok(self)
    }

    /// Total clocked bits per frame: data, then parity, then stop.
    pub fn frame_bits(&self) -> u8 {
        self.data_bits + (self.parity != Parity::None) as u8 + self.stop_bit as u8
    }

    fn data_mask(&self) -> u8 {
        (0xFF_u16 >> (8 - self.data_bits)) as u8
    }

    pub fn encode(&self, direction: Direction, value: u8) -> Result<BitFrame, RelayError> {
        if value & !self.data_mask() != 0 {
            return Err(RelayError::ValueTooWide {
                value,
                bits: self.data_bits,
            });
        }
        let mut frame = BitFrame::new(direction, 0);
        for i in 0..self.data_bits {
            let shift = match self.bit_order {
                BitOrder::LsbFirst => i,
                BitOrder::MsbFirst => self.data_bits - 1 - i,
            };
            frame.push((value >> shift) & 1 == 1, 0);
        }
        if let Some(parity) = self.parity.bit_for(value) {
            frame.push(parity, 0);
        }
        if self.stop_bit {
            frame.push(true, 0);
        }
        Ok(frame)
    }

    pub fn decode(&self, frame: &BitFrame) -> Result<u8, RelayError> {
        if frame.len() != self.frame_bits() {
            return Err(RelayError::FrameTimeout {
                bits: frame.len(),
                expected: self.frame_bits(),
            });
        }
        let mut value = 0u8;
        for i in 0..self.data_bits {
            let shift = match self.bit_order {
                BitOrder::LsbFirst => i,
                BitOrder::MsbFirst => self.data_bits - 1 - i,
            };
            value |= (frame.bit(i) as u8) << shift;
        }
        let mut next = self.data_bits;
        if let Some(expected) = self.parity.bit_for(value) {
            if frame.bit(next) != expected {
                return Err(Violation::Parity.into());
            }
            next += 1;
        }
        if self.stop_bit && !frame.bit(next) {
            return Err(Violation::StopBit.into());
        }
        Ok(value)
    }
}

impl fmt::Display for BitCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let order = match self.bit_order {
            BitOrder::LsbFirst => "lsb",
            BitOrder::MsbFirst => "msb",
        };
        let parity = match self.parity {
            Parity::None => "none",
            Parity::Odd => "odd",
            Parity::Even => "even",
        };
        write!(f, "{order},{},{parity}", self.clock_edge)?;
        if self.stop_bit {
            write!(f, ",stop")?;
        }
        if self.data_bits != 8 {
            write!(f, ",bits={}", self.data_bits)?;
        }
        Ok(())
    }
}

/// Parses `order,edge,parity[,stop][,bits=N]`, e.g. `lsb,falling,odd,stop`.
impl FromStr for BitCodec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |what: &str| ConfigError::Codec(format!("{what} in {s:?}"));
        let mut parts = s.split(',').map(str::trim);

        let bit_order = match parts.next() {
            Some("lsb") => BitOrder::LsbFirst,
            Some("msb") => BitOrder::MsbFirst,
            _ => return Err(bad("expected lsb or msb")),
        };
        let clock_edge = match parts.next() {
            Some("rising") => Edge::Rising,
            Some("falling") => Edge::Falling,
            _ => return Err(bad("expected rising or falling")),
        };
        let parity = match parts.next() {
            Some("none") => Parity::None,
            Some("odd") => Parity::Odd,
            Some("even") => Parity::Even,
            _ => return Err(bad("expected none, odd or even")),
        };

        let mut codec = BitCodec::new(bit_order, clock_edge, parity);
        for part in parts {
            if part == "stop" {
                codec = codec.with_stop_bit();
            } else if let Some(bits) = part.strip_prefix("bits=") {
                let bits = bits.parse().map_err(|_| bad("bad bit count"))?;
                codec = codec.with_data_bits(bits)?;
            } else {
                return Err(bad("unknown option"));
            }
        }
        Ok(codec)
    }
}
