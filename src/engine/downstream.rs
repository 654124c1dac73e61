//! Machine Feeder: the host-facing half of the bridge, and the only place
//! relayed bytes can be altered.

use std::collections::VecDeque;

use tracing::{debug, info};

use crate::address::AddressTable;
use crate::config::SegmentConfig;
use crate::error::{ConfigError, RelayError};
use crate::frame::Direction;
use crate::intercept::{Decision, InterceptionPolicy};
use crate::isolator::Side;
use crate::pins::{PinBinding, Role};
use crate::relay::{
    Ctx, Endpoint, FrameReceiver, FrameTransmitter, Phase, RelayCore, RelayStats, SegmentLines,
    Transmission,
};
use crate::signal::{Micros, PinEvent, PinId};

pub struct DownstreamEngine {
    core: RelayCore,
    link: SegmentConfig,
    host: SegmentConfig,
    link_clock: PinId,
    link_data: PinId,
    isolator: PinId,
    host_irq: PinId,
    bus_clock: PinId,
    bus_data: PinId,
    addresses: AddressTable,
    selected: usize,
    policy: Box<dyn InterceptionPolicy>,
    injected: VecDeque<u8>,
}

impl DownstreamEngine {
    pub fn new(
        pins: &PinBinding,
        link: SegmentConfig,
        host: SegmentConfig,
        addresses: AddressTable,
        policy: Box<dyn InterceptionPolicy>,
    ) -> Result<Self, ConfigError> {
        let link_clock = pins.require(Role::ClockIn)?;
        let link_data = pins.require(Role::DataIn)?;
        let isolator = pins.require(Role::IsolatorEnable)?;
        let host_irq = pins.require(Role::IrqOut)?;
        let bus_clock = pins.require(Role::BusClock)?;
        let bus_data = pins.require(Role::BusData)?;
        let status = pins.require(Role::StatusOut)?;

        let receivers = [
            FrameReceiver::new(
                Direction::KeyboardToHost,
                SegmentLines::requested(isolator, link_clock, link_data),
                link.codec,
                link.timing.timeout,
            )
            .with_guard(link.timing.bit_period),
            FrameReceiver::new(
                Direction::HostToKeyboard,
                SegmentLines::start_bit(bus_data, bus_clock),
                host.codec,
                host.timing.timeout,
            )
            .with_guard(host.timing.bit_period),
        ];

        Ok(Self {
            core: RelayCore::new("FEED", status, isolator, receivers),
            link,
            host,
            link_clock,
            link_data,
            isolator,
            host_irq,
            bus_clock,
            bus_data,
            addresses,
            selected: 0,
            policy,
            injected: VecDeque::new(),
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

    pub fn addresses(&self) -> &AddressTable {
        &self.addresses
    }

    /// The address the interception hook sees.
    pub fn current_address(&self) -> u8 {
        self.addresses
            .get(self.selected)
            .unwrap_or(self.addresses.default_address())
    }

    /// Select a table entry. An out-of-range index faults the engine until
    /// the next valid selection.
    pub fn select_address(&mut self, index: usize, ctx: &mut Ctx) -> Result<u8, RelayError> {
        match self.addresses.get(index) {
            Some(address) => {
                info!("FEED: selected address {address:02X} (entry {index})");
                self.selected = index;
                self.core.clear_fault();
                self.pump(ctx);
                Ok(address)
            }
            None => {
                let err = RelayError::AddressRejected {
                    index,
                    len: self.addresses.len(),
                };
                self.core.halt(err, ctx);
                Err(err)
            }
        }
    }

    /// Queue a keystroke for the host. Sent once nothing relayed is waiting,
    /// not intercepted.
    pub fn inject(&mut self, byte: u8) {
        self.injected.push_back(byte);
    }

    pub fn pending_injections(&self) -> usize {
        self.injected.len()
    }

    fn transmission(
        &self,
        direction: Direction,
        byte: u8,
        ctx: &mut Ctx,
    ) -> Result<Transmission, RelayError> {
        match direction {
            Direction::KeyboardToHost => {
                let frame = self.host.codec.encode(direction, byte)?;
                let lines = SegmentLines::requested(self.host_irq, self.bus_clock, self.bus_data);
                let tx = FrameTransmitter::new(
                    lines,
                    &self.host.codec,
                    &self.host.timing,
                    &frame,
                    ctx.now,
                );
                Ok(Transmission::new(direction, byte, tx))
            }
            Direction::HostToKeyboard => {
                let frame = self.link.codec.encode(direction, byte)?;
                let token = ctx.isolator.acquire(Side::Machine, self.isolator)?;
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
        }
    }

    /// Run a completed byte past the hook and queue what comes out.
    fn intercept(&mut self, direction: Direction, byte: u8) {
        let address = self.current_address();
        let decision = self.policy.intercept(direction, address, byte);
        let Some(out) = decision.apply(byte) else {
            debug!("FEED: suppressed {direction} {byte:02X} for {address:02X}");
            self.core.stats_mut().suppressed += 1;
            return;
        };
        if let Decision::Modify(_) = decision {
            debug!("FEED: {direction} {byte:02X} -> {out:02X} for {address:02X}");
            self.core.stats_mut().modified += 1;
        }
        self.core.enqueue(direction, out);
    }

    /// Start the next queued byte if its lines are free.
    fn pump(&mut self, ctx: &mut Ctx) {
        if self.core.is_ready() {
            if let Some(byte) = self.injected.pop_front() {
                debug!("FEED: injecting {byte:02X}");
                self.core.stats_mut().injected += 1;
                self.core.enqueue(Direction::KeyboardToHost, byte);
            }
        }
        while let Some((direction, byte)) = self.core.next_ready(ctx) {
            match self.transmission(direction, byte, ctx) {
                Ok(tx) => self.core.begin(tx, ctx),
                Err(err) => self.core.discard(err),
            }
        }
        self.core.sync_status(ctx);
    }
}

impl Endpoint for DownstreamEngine {
    fn on_edge(&mut self, event: PinEvent, ctx: &mut Ctx) {
        if let Some((direction, byte)) = self.core.on_edge(event, ctx) {
            self.intercept(direction, byte);
        }
        self.pump(ctx);
    }

    fn poll(&mut self, ctx: &mut Ctx) {
        self.core.poll(ctx);
        self.pump(ctx);
    }

    fn next_deadline(&self) -> Option<Micros> {
        if self.core.is_ready() && !self.injected.is_empty() {
            return Some(0);
        }
        self.core.deadline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::intercept::{Passthrough, Remap};
    use crate::isolator::Isolator;
    use crate::signal::{Drive, Edge, Level};

    const K2H: Direction = Direction::KeyboardToHost;
    const H2K: Direction = Direction::HostToKeyboard;

    fn engine(policy: Box<dyn InterceptionPolicy>) -> DownstreamEngine {
        let config = BridgeConfig::new(
            "lsb,falling,odd".parse().unwrap(),
            "msb,rising,none".parse().unwrap(),
        );
        DownstreamEngine::new(
            &config.feeder_pins,
            config.link,
            config.host,
            config.addresses,
            policy,
        )
        .unwrap()
    }

    /// Clock a link frame in, as the keyboard processor would send it.
    fn link_frame(engine: &mut DownstreamEngine, ctx: &mut Ctx, byte: u8) {
        let frame = engine.link.codec.encode(K2H, byte).unwrap();
        let t0 = ctx.now;
        engine.on_edge(PinEvent::new(9, Edge::Rising, t0), ctx);
        let mut data = Level::High;
        for (i, bit) in frame.iter().enumerate() {
            let at = t0 + 2 + i as Micros * 8;
            ctx.now = at;
            if let Some(edge) = Edge::between(data, bit.into()) {
                engine.on_edge(PinEvent::new(8, edge, at), ctx);
                data = bit.into();
            }
            ctx.now = at + 2;
            engine.on_edge(PinEvent::new(7, Edge::Rising, at + 2), ctx);
            ctx.now = at + 4;
            engine.on_edge(PinEvent::new(7, Edge::Falling, at + 4), ctx);
        }
        // release data, then isolator enable
        ctx.now += 4;
        if data == Level::Low {
            engine.on_edge(PinEvent::new(8, Edge::Rising, ctx.now), ctx);
        }
        ctx.now += 2;
        engine.on_edge(PinEvent::new(9, Edge::Falling, ctx.now), ctx);
    }

    /// Clock the bits of a host command in, its start condition already sent.
    fn bus_bits(engine: &mut DownstreamEngine, ctx: &mut Ctx, byte: u8) {
        let frame = engine.host.codec.encode(H2K, byte).unwrap();
        let t0 = ctx.now;
        let mut data = Level::Low;
        for (i, bit) in frame.iter().enumerate() {
            let at = t0 + i as Micros * 10;
            ctx.now = at;
            if let Some(edge) = Edge::between(data, bit.into()) {
                engine.on_edge(PinEvent::new(18, edge, at), ctx);
                data = bit.into();
            }
            ctx.now = at + 2;
            engine.on_edge(PinEvent::new(19, Edge::Rising, at + 2), ctx);
            ctx.now = at + 5;
            engine.on_edge(PinEvent::new(19, Edge::Falling, at + 5), ctx);
        }
        ctx.now += 5;
        if data == Level::Low {
            engine.on_edge(PinEvent::new(18, Edge::Rising, ctx.now), ctx);
        }
    }

    /// Byte the host bus would see, from the drives on bus clock and data.
    fn host_byte(engine: &DownstreamEngine, drives: &[Drive]) -> u8 {
        let mut data = Level::High;
        let mut frame = crate::frame::BitFrame::new(K2H, 0);
        for d in drives {
            if d.pin == 18 {
                data = d.level;
            } else if d.pin == 19 && d.level == Level::High {
                frame.push(data.is_high(), 0);
            }
        }
        engine.host.codec.decode(&frame).unwrap()
    }

    fn drain(engine: &mut DownstreamEngine, ctx: &mut Ctx) {
        while let Some(at) = engine.next_deadline() {
            ctx.now = ctx.now.max(at);
            engine.poll(ctx);
        }
    }

    #[test]
    fn test_link_byte_reaches_host_bus() {
        let mut iso = Isolator::new();
        let mut ctx = Ctx::new(0, &mut iso);
        let mut engine = engine(Box::new(Passthrough));
        link_frame(&mut engine, &mut ctx, 0x41);
        drain(&mut engine, &mut ctx);
        assert_eq!(host_byte(&engine, &ctx.drives), 0x41);
        assert_eq!(engine.stats().forwarded, 1);
        assert_eq!(engine.phase(), Phase::Idle);
        assert!(ctx.drives.contains(&Drive { pin: 6, level: Level::High }));
        assert_eq!(ctx.drives.last(), Some(&Drive { pin: 10, level: Level::Low }));
    }

    #[test]
    fn test_remap_and_suppress() {
        let policy = Remap::new().map(K2H, 0x41, 0x42).suppress(K2H, 0x1B);
        let mut iso = Isolator::new();
        let mut ctx = Ctx::new(0, &mut iso);
        let mut engine = engine(Box::new(policy));

        link_frame(&mut engine, &mut ctx, 0x41);
        drain(&mut engine, &mut ctx);
        assert_eq!(host_byte(&engine, &ctx.drives), 0x42);
        assert_eq!(engine.stats().modified, 1);

        ctx.drives.clear();
        ctx.now += 1_000;
        link_frame(&mut engine, &mut ctx, 0x1B);
        drain(&mut engine, &mut ctx);
        assert_eq!(engine.stats().suppressed, 1);
        assert_eq!(engine.stats().forwarded, 1);
        assert!(!ctx.drives.iter().any(|d| d.pin == 6 || d.pin == 19));
    }

    #[test]
    fn test_hook_sees_selected_address() {
        let mut iso = Isolator::new();
        let mut ctx = Ctx::new(0, &mut iso);
        let mut engine = engine(Box::new(|_: Direction, address: u8, byte: u8| {
            if address == 0x5C {
                Decision::Modify(byte ^ 0x20)
            } else {
                Decision::Forward
            }
        }));
        assert_eq!(engine.current_address(), 0x5A);
        assert_eq!(engine.select_address(2, &mut ctx), Ok(0x5C));
        assert_eq!(engine.current_address(), 0x5C);
        link_frame(&mut engine, &mut ctx, 0x41);
        drain(&mut engine, &mut ctx);
        assert_eq!(host_byte(&engine, &ctx.drives), 0x61);
    }

    #[test]
    fn test_rejected_address_is_sticky() {
        let mut iso = Isolator::new();
        let mut ctx = Ctx::new(0, &mut iso);
        let mut engine = engine(Box::new(Passthrough));
        assert_eq!(
            engine.select_address(4, &mut ctx),
            Err(RelayError::AddressRejected { index: 4, len: 4 })
        );
        assert_eq!(engine.phase(), Phase::Fault);
        assert_eq!(engine.current_address(), 0x5A);

        link_frame(&mut engine, &mut ctx, 0x41);
        drain(&mut engine, &mut ctx);
        assert_eq!(engine.stats().received, 0);
        assert_eq!(engine.phase(), Phase::Fault);

        engine.select_address(1, &mut ctx).unwrap();
        assert_eq!(engine.phase(), Phase::Idle);
        assert_eq!(engine.current_address(), 0x5B);
    }

    #[test]
    fn test_injection_in_order() {
        let mut iso = Isolator::new();
        let mut ctx = Ctx::new(0, &mut iso);
        let mut engine = engine(Box::new(Passthrough));
        engine.inject(0x10);
        engine.inject(0x20);
        assert_eq!(engine.next_deadline(), Some(0));

        drain(&mut engine, &mut ctx);
        assert_eq!(engine.stats().injected, 2);
        assert_eq!(engine.stats().forwarded, 2);
        assert_eq!(engine.pending_injections(), 0);

        // split the drives at the second IRQ assertion
        let second = ctx
            .drives
            .iter()
            .rposition(|d| *d == Drive { pin: 6, level: Level::High })
            .unwrap();
        assert_eq!(host_byte(&engine, &ctx.drives[..second]), 0x10);
        assert_eq!(host_byte(&engine, &ctx.drives[second..]), 0x20);
    }

    #[test]
    fn test_keystroke_waits_for_host_command() {
        let mut iso = Isolator::new();
        let mut ctx = Ctx::new(0, &mut iso);
        let mut engine = engine(Box::new(Passthrough));

        // the host starts a command just before a keystroke arrives
        engine.on_edge(PinEvent::new(18, Edge::Falling, 0), &mut ctx);
        ctx.now = 1;
        link_frame(&mut engine, &mut ctx, 0x41);
        assert_eq!(engine.stats().received, 1);
        assert_eq!(engine.phase(), Phase::Forwarding);
        assert!(!ctx.drives.iter().any(|d| d.pin == 6 || d.pin == 18 || d.pin == 19));

        ctx.now += 10;
        bus_bits(&mut engine, &mut ctx, 0xED);
        assert_eq!(engine.stats().received, 2);
        drain(&mut engine, &mut ctx);
        assert_eq!(engine.stats().forwarded, 2);
        assert_eq!(engine.last_fault(), None);
        assert_eq!(host_byte(&engine, &ctx.drives), 0x41);

        // then the command goes out on the link, in completion order
        let irq_done = ctx
            .drives
            .iter()
            .position(|d| *d == Drive { pin: 6, level: Level::Low })
            .unwrap();
        let link_start = ctx
            .drives
            .iter()
            .position(|d| *d == Drive { pin: 9, level: Level::High })
            .unwrap();
        assert!(irq_done < link_start);
        assert!(!ctx.isolator.is_active());
    }
}
