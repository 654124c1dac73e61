//! Keyboard Processor: the keyboard-facing half of the bridge.

use tracing::debug;

use crate::config::SegmentConfig;
use crate::error::{ConfigError, RelayError};
use crate::frame::Direction;
use crate::isolator::Side;
use crate::pins::{PinBinding, Role};
use crate::relay::{
    Ctx, Endpoint, FrameReceiver, FrameTransmitter, Phase, RelayCore, RelayStats, SegmentLines,
    Transmission,
};
use crate::signal::{Micros, PinEvent, PinId};

pub struct UpstreamEngine {
    core: RelayCore,
    keyboard: SegmentConfig,
    link: SegmentConfig,
    kbd_data: PinId,
    kbd_clock: PinId,
    kbd_ack: PinId,
    link_clock: PinId,
    link_data: PinId,
    isolator: PinId,
}

impl UpstreamEngine {
    pub fn new(
        pins: &PinBinding,
        keyboard: SegmentConfig,
        link: SegmentConfig,
    ) -> Result<Self, ConfigError> {
        let kbd_data = pins.require(Role::DataRequestIn)?;
        let kbd_clock = pins.require(Role::ClockIn)?;
        let kbd_ack = pins.require(Role::PeripheralIrqIn)?;
        let link_clock = pins.require(Role::IrqOut)?;
        let link_data = pins.require(Role::DataOut)?;
        let isolator = pins.require(Role::IsolatorEnable)?;
        let status = pins.require(Role::StatusOut)?;

        let receivers = [
            FrameReceiver::new(
                Direction::KeyboardToHost,
                SegmentLines::start_bit(kbd_data, kbd_clock),
                keyboard.codec,
                keyboard.timing.timeout,
            )
            .with_guard(keyboard.timing.bit_period),
            FrameReceiver::new(
                Direction::HostToKeyboard,
                SegmentLines::requested(isolator, link_clock, link_data),
                link.codec,
                link.timing.timeout,
            )
            .with_guard(link.timing.bit_period),
        ];

        Ok(Self {
            core: RelayCore::new("KBDP", status, isolator, receivers),
            keyboard,
            link,
            kbd_data,
            kbd_clock,
            kbd_ack,
            link_clock,
            link_data,
            isolator,
        })
    }

    pub fn phase(&self) -> Phase {
        self.core.phase()
    }

    pub fn stats(&self) -> &RelayStats {
        self.core.stats()
    }

    pub fn last_fault(&self) -> Option<RelayError> {
        self.core.last_fault()
    }

    /// Keyboard bytes go out on the link; link bytes are replayed to the
    /// keyboard, which must acknowledge them.
    fn transmission(
        &self,
        direction: Direction,
        byte: u8,
        ctx: &mut Ctx,
    ) -> Result<Transmission, RelayError> {
        match direction {
            Direction::KeyboardToHost => {
                let frame = self.link.codec.encode(direction, byte)?;
                let token = ctx.isolator.acquire(Side::Keyboard, self.isolator)?;
                let lines = SegmentLines::link(&token, self.link_clock, self.link_data);
                let tx = FrameTransmitter::new(
                    lines,
                    &self.link.codec,
                    &self.link.timing,
                    &frame,
                    ctx.now,
                );
                Ok(Transmission::new(direction, byte, tx).holding(token))
            }
            Direction::HostToKeyboard => {
                let frame = self.keyboard.codec.encode(direction, byte)?;
                let lines = SegmentLines::start_bit(self.kbd_data, self.kbd_clock);
                let tx = FrameTransmitter::new(
                    lines,
                    &self.keyboard.codec,
                    &self.keyboard.timing,
                    &frame,
                    ctx.now,
                );
                Ok(Transmission::new(direction, byte, tx)
                    .acknowledged_on(self.kbd_ack, self.keyboard.timing.timeout))
            }
        }
    }

    /// Start the next queued byte if its lines are free.
    fn pump(&mut self, ctx: &mut Ctx) {
        while let Some((direction, byte)) = self.core.next_ready(ctx) {
            debug!("KBDP: forwarding {direction} {byte:02X}");
            match self.transmission(direction, byte, ctx) {
                Ok(tx) => self.core.begin(tx, ctx),
                Err(err) => self.core.discard(err),
            }
        }
        self.core.sync_status(ctx);
    }
}

impl Endpoint for UpstreamEngine {
    fn on_edge(&mut self, event: PinEvent, ctx: &mut Ctx) {
        if let Some((direction, byte)) = self.core.on_edge(event, ctx) {
            self.core.enqueue(direction, byte);
        }
        self.pump(ctx);
    }

    fn poll(&mut self, ctx: &mut Ctx) {
        self.core.poll(ctx);
        self.pump(ctx);
    }

    fn next_deadline(&self) -> Option<Micros> {
        self.core.deadline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::isolator::Isolator;
    use crate::signal::{Drive, Edge, Level};

    fn engine() -> UpstreamEngine {
        let config = BridgeConfig::new(
            "lsb,falling,odd".parse().unwrap(),
            "msb,rising,none".parse().unwrap(),
        );
        UpstreamEngine::new(&config.keyboard_pins, config.keyboard, config.link).unwrap()
    }

    /// Clock a keyboard frame into the engine at keyboard timing.
    fn keyboard_frame(engine: &mut UpstreamEngine, iso: &mut Isolator, byte: u8) -> Vec<Drive> {
        let codec = engine.keyboard.codec;
        let frame = codec.encode(Direction::KeyboardToHost, byte).unwrap();
        let mut ctx = Ctx::new(0, iso);
        engine.on_edge(PinEvent::new(3, Edge::Falling, 0), &mut ctx);
        let mut data = Level::Low;
        let mut at = 0;
        for bit in frame.iter() {
            at += 100;
            ctx.now = at;
            if let Some(edge) = Edge::between(data, bit.into()) {
                engine.on_edge(PinEvent::new(3, edge, at), &mut ctx);
                data = bit.into();
            }
            ctx.now = at + 10;
            engine.on_edge(PinEvent::new(4, Edge::Falling, at + 10), &mut ctx);
            ctx.now = at + 50;
            engine.on_edge(PinEvent::new(4, Edge::Rising, at + 50), &mut ctx);
        }
        ctx.drives
    }

    #[test]
    fn test_keyboard_byte_raises_isolator() {
        let mut iso = Isolator::new();
        let mut engine = engine();
        let drives = keyboard_frame(&mut engine, &mut iso, 0x41);
        assert_eq!(engine.stats().received, 1);
        assert_eq!(engine.phase(), Phase::Forwarding);
        assert!(iso.is_active());
        assert!(drives.contains(&Drive { pin: 8, level: Level::High }));
        assert!(drives.contains(&Drive { pin: 10, level: Level::High }));
    }

    #[test]
    fn test_contention_while_holding_token() {
        let mut iso = Isolator::new();
        let mut engine = engine();
        keyboard_frame(&mut engine, &mut iso, 0x41);

        let mut ctx = Ctx::new(1_000, &mut iso);
        engine.on_edge(PinEvent::new(8, Edge::Rising, 1_000), &mut ctx);
        assert_eq!(engine.last_fault(), Some(RelayError::BusContention));
        assert_eq!(engine.phase(), Phase::Idle);
        assert!(ctx.drives.contains(&Drive { pin: 8, level: Level::Low }));
        assert!(!ctx.isolator.is_active());
    }

    #[test]
    fn test_held_link_defers_keyboard_byte() {
        let mut iso = Isolator::new();
        let other = iso.acquire(Side::Machine, 9).unwrap();
        let mut engine = engine();
        keyboard_frame(&mut engine, &mut iso, 0x41);
        assert_eq!(engine.last_fault(), None);
        assert_eq!(engine.phase(), Phase::Forwarding);
        assert_eq!(engine.next_deadline(), None);

        // the feeder finishes and drops isolator-enable
        let mut ctx = Ctx::new(1_000, &mut iso);
        ctx.release(other);
        engine.on_edge(PinEvent::new(8, Edge::Falling, 1_000), &mut ctx);
        assert_eq!(engine.next_deadline(), Some(1_008));

        ctx.now = 1_008;
        engine.poll(&mut ctx);
        assert!(ctx.drives.contains(&Drive { pin: 8, level: Level::High }));
        assert_eq!(ctx.isolator.holder(), Some(Side::Keyboard));
        assert_eq!(engine.stats().contentions, 0);
    }
}
