//! Pin bindings for the two boards.
//!
//! Each engine is handed its own [`PinBinding`] at construction; nothing here
//! changes at runtime.

use std::fmt;

use tracing::trace;

use crate::error::ConfigError;
use crate::signal::PinId;

/// Logical signal role of a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// IRQ toward the next stage. On the keyboard processor this line also
    /// clocks the link.
    IrqOut,
    DataOut,
    DataIn,
    /// Keyboard data line; its falling edge is the keyboard's request.
    DataRequestIn,
    ClockIn,
    /// IRQ from the keyboard, used as the acknowledge of host commands.
    PeripheralIrqIn,
    IsolatorEnable,
    StatusOut,
    BusClock,
    BusData,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::IrqOut => "irq-out",
            Role::DataOut => "data-out",
            Role::DataIn => "data-in",
            Role::DataRequestIn => "data-request-in",
            Role::ClockIn => "clock-in",
            Role::PeripheralIrqIn => "peripheral-irq-in",
            Role::IsolatorEnable => "isolator-enable",
            Role::StatusOut => "status-out",
            Role::BusClock => "bus-clock",
            Role::BusData => "bus-data",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "irq-out" => Role::IrqOut,
            "data-out" => Role::DataOut,
            "data-in" => Role::DataIn,
            "data-request-in" => Role::DataRequestIn,
            "clock-in" => Role::ClockIn,
            "peripheral-irq-in" => Role::PeripheralIrqIn,
            "isolator-enable" => Role::IsolatorEnable,
            "status-out" => Role::StatusOut,
            "bus-clock" => Role::BusClock,
            "bus-data" => Role::BusData,
            _ => return Err(ConfigError::UnknownRole(s.to_string())),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinBinding {
    pins: Vec<(Role, PinId)>,
}

impl PinBinding {
    /// Build a binding, rejecting a physical pin bound to two roles.
    pub fn new(pins: &[(Role, PinId)]) -> Result<Self, ConfigError> {
        let mut binding = Self { pins: Vec::new() };
        for &(role, pin) in pins {
            binding = binding.with(role, pin)?;
        }
        Ok(binding)
    }

    /// Bind (or rebind) `role` to `pin`.
    pub fn with(mut self, role: Role, pin: PinId) -> Result<Self, ConfigError> {
        self.pins.retain(|&(r, _)| r != role);
        if let Some(&(first, _)) = self.pins.iter().find(|&&(_, p)| p == pin) {
            return Err(ConfigError::PinConflict {
                pin,
                first,
                second: role,
            });
        }
        trace!("PINS: {role} = {pin}");
        self.pins.push((role, pin));
        Ok(self)
    }

    /// Keyboard Processor board.
    pub fn keyboard_processor() -> Self {
        Self {
            pins: vec![
                (Role::IrqOut, 6),
                (Role::DataOut, 7),
                (Role::IsolatorEnable, 8),
                (Role::StatusOut, 10),
                (Role::DataRequestIn, 3),
                (Role::ClockIn, 4),
                (Role::PeripheralIrqIn, 2),
            ],
        }
    }

    /// Machine Feeder board. The bus pair sits on the hardware I2C pins.
    pub fn machine_feeder() -> Self {
        Self {
            pins: vec![
                (Role::IsolatorEnable, 9),
                (Role::StatusOut, 10),
                (Role::IrqOut, 6),
                (Role::ClockIn, 7),
                (Role::DataIn, 8),
                (Role::BusData, 18),
                (Role::BusClock, 19),
            ],
        }
    }

    pub fn get(&self, role: Role) -> Option<PinId> {
        self.pins.iter().find(|&&(r, _)| r == role).map(|&(_, p)| p)
    }

    pub fn require(&self, role: Role) -> Result<PinId, ConfigError> {
        self.get(role).ok_or(ConfigError::MissingPin(role))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Role, PinId)> + '_ {
        self.pins.iter().copied()
    }
}
