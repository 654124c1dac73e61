//! Bridge configuration: pin bindings, address table and per-segment framing.

use std::str::FromStr;

use tracing::debug;

use crate::address::AddressTable;
use crate::codec::{BitCodec, BitOrder, Parity};
use crate::error::ConfigError;
use crate::pins::{PinBinding, Role};
use crate::signal::{Edge, Micros, PinId};
use crate::timing::{HOST_TIMING, KEYBOARD_TIMING, LINK_TIMING, SegmentTiming};

/// Framing and timing of one hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentConfig {
    pub codec: BitCodec,
    pub timing: SegmentTiming,
}

impl SegmentConfig {
    pub fn new(codec: BitCodec, timing: SegmentTiming) -> Self {
        Self { codec, timing }
    }

    /// Request assert to request release for one frame.
    pub fn frame_duration(&self) -> Micros {
        self.timing.frame_duration(self.codec.frame_bits())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Board {
    KeyboardProcessor,
    MachineFeeder,
}

/// `keyboard:status-out=13` or `feeder:bus-clock=21`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinOverride {
    pub board: Board,
    pub role: Role,
    pub pin: PinId,
}

impl FromStr for PinOverride {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::UnknownRole(s.to_string());
        let (board, rest) = s.split_once(':').ok_or_else(bad)?;
        let (role, pin) = rest.split_once('=').ok_or_else(bad)?;
        let board = match board {
            "keyboard" => Board::KeyboardProcessor,
            "feeder" => Board::MachineFeeder,
            _ => return Err(bad()),
        };
        Ok(Self {
            board,
            role: role.parse()?,
            pin: pin.parse().map_err(|_| bad())?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub keyboard_pins: PinBinding,
    pub feeder_pins: PinBinding,
    pub addresses: AddressTable,
    pub keyboard: SegmentConfig,
    pub link: SegmentConfig,
    pub host: SegmentConfig,
}

impl BridgeConfig {
    /// Board presets and default timings. The keyboard and host framing
    /// depend on the attached hardware and have no defaults.
    pub fn new(keyboard_codec: BitCodec, host_codec: BitCodec) -> Self {
        Self {
            keyboard_pins: PinBinding::keyboard_processor(),
            feeder_pins: PinBinding::machine_feeder(),
            addresses: AddressTable::default(),
            keyboard: SegmentConfig::new(keyboard_codec, KEYBOARD_TIMING),
            link: SegmentConfig::new(Self::default_link_codec(), LINK_TIMING),
            host: SegmentConfig::new(host_codec, HOST_TIMING),
        }
    }

    /// Both ends of the link run this firmware, so its framing is ours.
    pub fn default_link_codec() -> BitCodec {
        BitCodec::new(BitOrder::LsbFirst, Edge::Rising, Parity::Even)
    }

    /// Parse command-line arguments into BridgeConfig
    pub fn from_args(
        keyboard_codec: BitCodec,
        host_codec: BitCodec,
        link_codec: Option<BitCodec>,
        addresses: &[u8],
        pins: &[PinOverride],
    ) -> Result<Self, ConfigError> {
        let mut config = Self::new(keyboard_codec, host_codec);
        if let Some(codec) = link_codec {
            config.link.codec = codec;
        }
        if !addresses.is_empty() {
            config.addresses = AddressTable::new(addresses)?;
        }
        for o in pins {
            let binding = match o.board {
                Board::KeyboardProcessor => &mut config.keyboard_pins,
                Board::MachineFeeder => &mut config.feeder_pins,
            };
            *binding = binding.clone().with(o.role, o.pin)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.keyboard.timing.validate("keyboard")?;
        self.link.timing.validate("link")?;
        self.host.timing.validate("host")?;
        if self.link.frame_duration() > self.keyboard.timing.bit_period {
            return Err(ConfigError::Timing {
                segment: "link",
                reason: "frame does not fit in one keyboard bit period",
            });
        }
        debug!(
            "CONFIG: keyboard {} link {} host {}, addresses {:?}",
            self.keyboard.codec, self.link.codec, self.host.codec, self.addresses
        );
        Ok(())
    }

    /// Worst case from the keyboard's last sampled bit to the host's.
    pub fn relay_latency_budget(&self) -> Micros {
        self.link.frame_duration() + self.host.frame_duration()
    }
}
