use crate::error::ConfigError;
use crate::signal::Micros;

/// Bit timing of one segment. All values in microseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentTiming {
    /// Data change to data change.
    pub bit_period: Micros,
    /// Data settles this long before the sampling edge (and the request
    /// leads the first bit by the same amount).
    pub setup: Micros,
    /// Longest gap between two edges of one frame before it is abandoned.
    pub timeout: Micros,
}

/// Legacy keyboard: ~10 kHz clock.
pub const KEYBOARD_TIMING: SegmentTiming = SegmentTiming {
    bit_period: 100,
    setup: 10,
    timeout: 2_000,
};

/// Isolated link; both ends run our firmware.
pub const LINK_TIMING: SegmentTiming = SegmentTiming {
    bit_period: 8,
    setup: 2,
    timeout: 400,
};

/// Host bus at 100 kHz.
pub const HOST_TIMING: SegmentTiming = SegmentTiming {
    bit_period: 10,
    setup: 2,
    timeout: 500,
};

impl SegmentTiming {
    /// Request assert to request release for a frame of `bits` bits.
    pub fn frame_duration(&self, bits: u8) -> Micros {
        self.setup + bits as Micros * self.bit_period + self.setup
    }

    pub fn validate(&self, segment: &'static str) -> Result<(), ConfigError> {
        let reason = if self.bit_period == 0 {
            "bit period is zero"
        } else if self.setup == 0 || self.setup * 2 >= self.bit_period {
            "setup must be non-zero and under half a bit period"
        } else if self.bit_period >= self.timeout {
            "timeout must exceed the bit period"
        } else {
            return Ok(());
        };
        Err(ConfigError::Timing { segment, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_valid() {
        KEYBOARD_TIMING.validate("keyboard").unwrap();
        LINK_TIMING.validate("link").unwrap();
        HOST_TIMING.validate("host").unwrap();
    }

    #[test]
    fn test_link_fits_in_keyboard_bit() {
        // 8 data bits plus parity
        assert!(LINK_TIMING.frame_duration(9) <= KEYBOARD_TIMING.bit_period);
    }

    #[test]
    fn test_invalid_timing() {
        let timing = SegmentTiming {
            bit_period: 10,
            setup: 5,
            timeout: 100,
        };
        assert!(matches!(
            timing.validate("x"),
            Err(ConfigError::Timing { segment: "x", .. })
        ));
        let timing = SegmentTiming {
            bit_period: 100,
            setup: 10,
            timeout: 100,
        };
        assert!(timing.validate("x").is_err());
    }
}
