use std::fmt;

/// Physical pin identifier, as printed on the board.
pub type PinId = u8;

/// Timestamps and durations, in microseconds since the bridge started.
pub type Micros = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum Level {
    #[default]
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }

    pub fn inverted(self) -> Self {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

impl From<bool> for Level {
    fn from(b: bool) -> Self {
        if b { Level::High } else { Level::Low }
    }
}

impl From<Level> for bool {
    fn from(level: Level) -> Self {
        level.is_high()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    Rising,
    Falling,
}

impl Edge {
    /// The edge seen when a line moves from `from` to `to`, if it moved at all.
    pub fn between(from: Level, to: Level) -> Option<Self> {
        match (from, to) {
            (Level::Low, Level::High) => Some(Edge::Rising),
            (Level::High, Level::Low) => Some(Edge::Falling),
            _ => None,
        }
    }

    /// Level of the line after this edge.
    pub fn level(self) -> Level {
        match self {
            Edge::Rising => Level::High,
            Edge::Falling => Level::Low,
        }
    }

    /// Level of the line before this edge, i.e. where a clock idles if it
    /// samples on this edge.
    pub fn idle_level(self) -> Level {
        self.level().inverted()
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Rising => write!(f, "rising"),
            Edge::Falling => write!(f, "falling"),
        }
    }
}

/// One observed transition on one of an endpoint's own pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinEvent {
    pub pin: PinId,
    pub edge: Edge,
    pub at: Micros,
}

impl PinEvent {
    pub fn new(pin: PinId, edge: Edge, at: Micros) -> Self {
        Self { pin, edge, at }
    }

    pub fn level(&self) -> Level {
        self.edge.level()
    }
}

/// A request from an endpoint to move one of its own pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drive {
    pub pin: PinId,
    pub level: Level,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_between() {
        assert_eq!(Edge::between(Level::Low, Level::High), Some(Edge::Rising));
        assert_eq!(Edge::between(Level::High, Level::Low), Some(Edge::Falling));
        assert_eq!(Edge::between(Level::High, Level::High), None);
        assert_eq!(Edge::between(Level::Low, Level::Low), None);
    }

    #[test]
    fn test_idle_level() {
        assert_eq!(Edge::Rising.idle_level(), Level::Low);
        assert_eq!(Edge::Falling.idle_level(), Level::High);
        let b: bool = Edge::Rising.level().into();
        assert!(b);
    }
}
