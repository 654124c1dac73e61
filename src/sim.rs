//! Simulated keyboard and host attached to the outer ends of the bridge.
//!
//! Both are built from the same framing pieces as the engines, so they speak
//! exactly the codec and timing the bridge is configured with.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::config::SegmentConfig;
use crate::frame::Direction;
use crate::relay::{Ctx, Endpoint, FrameReceiver, FrameTransmitter, Sample, SegmentLines};
use crate::signal::{Level, Micros, PinEvent, PinId};

pub const KBD_DATA: PinId = 1;
pub const KBD_CLOCK: PinId = 2;
pub const KBD_IRQ: PinId = 3;

pub const HOST_IRQ: PinId = 1;
pub const HOST_CLOCK: PinId = 2;
pub const HOST_DATA: PinId = 3;

#[derive(Debug)]
struct Outgoing {
    byte: u8,
    tx: FrameTransmitter,
    stall: Option<(usize, Micros)>,
}

/// One side of a segment: an outbox clocked out one frame at a time and a
/// receiver for the other direction.
#[derive(Debug)]
struct Port {
    name: &'static str,
    segment: SegmentConfig,
    direction: Direction,
    lines: SegmentLines,
    rx: FrameReceiver,
    outbox: VecDeque<u8>,
    tx: Option<Outgoing>,
    next_start: Micros,
    stall: Option<(usize, Micros)>,
    sent: Vec<(u8, Micros)>,
    received: Vec<(u8, Micros)>,
}

impl Port {
    fn new(
        name: &'static str,
        segment: SegmentConfig,
        direction: Direction,
        lines: SegmentLines,
        rx: FrameReceiver,
    ) -> Self {
        Self {
            name,
            segment,
            direction,
            lines,
            rx,
            outbox: VecDeque::new(),
            tx: None,
            next_start: 0,
            stall: None,
            sent: Vec::new(),
            received: Vec::new(),
        }
    }

    fn on_edge(&mut self, event: &PinEvent, ctx: &mut Ctx) -> Option<u8> {
        match self.rx.on_edge(event) {
            Ok(Sample::Armed) => {
                self.back_off(ctx);
                None
            }
            Ok(Sample::Complete(byte)) => {
                debug!("{}: received {byte:02X} at {}", self.name, event.at);
                self.received.push((byte, event.at));
                Some(byte)
            }
            Ok(_) => None,
            Err(err) => {
                warn!("{}: {err}", self.name);
                None
            }
        }
    }

    /// The bridge always wins a start race: give the line up and send this
    /// byte again after its frame.
    fn back_off(&mut self, ctx: &mut Ctx) {
        let Some(mut out) = self.tx.take() else {
            return;
        };
        debug!("{}: backing off {:02X} at {}", self.name, out.byte, ctx.now);
        out.tx.abort(&mut ctx.drives);
        self.stall = out.stall;
        self.outbox.push_front(out.byte);
    }

    fn can_start(&self) -> bool {
        self.tx.is_none() && !self.outbox.is_empty()
    }

    /// When the next frame may start, if one is waiting and the lines are
    /// free.
    fn start_at(&self) -> Option<Micros> {
        if !self.can_start() {
            return None;
        }
        self.rx.quiet_at().map(|quiet| quiet.max(self.next_start))
    }

    fn poll(&mut self, ctx: &mut Ctx, ready: bool) {
        if let Err(err) = self.rx.expire(ctx.now) {
            warn!("{}: {err}", self.name);
        }

        if let Some(out) = self.tx.as_mut() {
            out.tx.due(ctx.now, &mut ctx.drives);
            if out.tx.is_done() {
                if out.stall.is_none() {
                    self.sent.push((out.byte, out.tx.ends_at()));
                }
                self.tx = None;
                self.next_start = ctx.now + 2 * self.segment.timing.bit_period;
            }
        }

        if ready && self.start_at().is_some_and(|at| ctx.now >= at) {
            if let Some(byte) = self.outbox.pop_front() {
                self.start(byte, ctx);
            }
        }
    }

    fn start(&mut self, byte: u8, ctx: &mut Ctx) {
        let frame = match self.segment.codec.encode(self.direction, byte) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("{}: cannot send {byte:02X}: {err}", self.name);
                return;
            }
        };
        let mut tx = FrameTransmitter::new(
            self.lines,
            &self.segment.codec,
            &self.segment.timing,
            &frame,
            ctx.now,
        );
        let stall = self.stall.take();
        if let Some((bits, hold)) = stall {
            debug!("{}: stalling {byte:02X} after {bits} bits", self.name);
            tx.stall_after(bits, hold);
        }
        debug!("{}: sending {byte:02X} at {}", self.name, ctx.now);
        tx.due(ctx.now, &mut ctx.drives);
        self.tx = Some(Outgoing { byte, tx, stall });
    }

    fn deadline(&self, ready: bool) -> Option<Micros> {
        let start = self.start_at().filter(|_| ready);
        let tx = self.tx.as_ref().and_then(|out| out.tx.next_at());
        [self.rx.deadline(), tx, start].into_iter().flatten().min()
    }
}

/// The legacy keyboard. Sends queued bytes and acknowledges every command it
/// receives with a pulse on its IRQ line.
#[derive(Debug)]
pub struct Keyboard {
    port: Port,
    acknowledge: bool,
    pulses: VecDeque<(Micros, Level)>,
}

impl Keyboard {
    pub fn new(segment: SegmentConfig) -> Self {
        let rx = FrameReceiver::new(
            Direction::HostToKeyboard,
            SegmentLines::start_bit(KBD_DATA, KBD_CLOCK),
            segment.codec,
            segment.timing.timeout,
        )
        .with_guard(segment.timing.bit_period);
        Self {
            port: Port::new(
                "KBD",
                segment,
                Direction::KeyboardToHost,
                SegmentLines::start_bit(KBD_DATA, KBD_CLOCK),
                rx,
            ),
            acknowledge: true,
            pulses: VecDeque::new(),
        }
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.port.outbox.extend(bytes);
    }

    /// Abandon the next frame after `bits` bits, holding the lines for
    /// `stall` before letting go.
    pub fn stall_after(&mut self, bits: usize, stall: Micros) {
        self.port.stall = Some((bits, stall));
    }

    pub fn set_acknowledge(&mut self, acknowledge: bool) {
        self.acknowledge = acknowledge;
    }

    /// Completed frames with the time the lines were released.
    pub fn sent(&self) -> &[(u8, Micros)] {
        &self.port.sent
    }

    pub fn received(&self) -> &[(u8, Micros)] {
        &self.port.received
    }
}

impl Endpoint for Keyboard {
    fn on_edge(&mut self, event: PinEvent, ctx: &mut Ctx) {
        if self.port.on_edge(&event, ctx).is_some() && self.acknowledge {
            let period = self.port.segment.timing.bit_period;
            self.pulses.push_back((event.at + period, Level::High));
            self.pulses.push_back((event.at + 2 * period, Level::Low));
        }
    }

    fn poll(&mut self, ctx: &mut Ctx) {
        while let Some(&(at, level)) = self.pulses.front() {
            if at > ctx.now {
                break;
            }
            ctx.drive(KBD_IRQ, level);
            self.pulses.pop_front();
        }
        self.port.poll(ctx, self.pulses.is_empty());
    }

    fn next_deadline(&self) -> Option<Micros> {
        let pulse = self.pulses.front().map(|&(at, _)| at);
        [pulse, self.port.deadline(self.pulses.is_empty())]
            .into_iter()
            .flatten()
            .min()
    }
}

/// The Presto Machine side: reads frames announced on its IRQ line and
/// sends commands on the bus.
#[derive(Debug)]
pub struct Host {
    port: Port,
}

impl Host {
    pub fn new(segment: SegmentConfig) -> Self {
        let rx = FrameReceiver::new(
            Direction::KeyboardToHost,
            SegmentLines::requested(HOST_IRQ, HOST_CLOCK, HOST_DATA),
            segment.codec,
            segment.timing.timeout,
        )
        .with_guard(segment.timing.bit_period);
        Self {
            port: Port::new(
                "HOST",
                segment,
                Direction::HostToKeyboard,
                SegmentLines::start_bit(HOST_DATA, HOST_CLOCK),
                rx,
            ),
        }
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.port.outbox.extend(bytes);
    }

    pub fn sent(&self) -> &[(u8, Micros)] {
        &self.port.sent
    }

    pub fn received(&self) -> &[(u8, Micros)] {
        &self.port.received
    }
}

impl Endpoint for Host {
    fn on_edge(&mut self, event: PinEvent, ctx: &mut Ctx) {
        self.port.on_edge(&event, ctx);
    }

    fn poll(&mut self, ctx: &mut Ctx) {
        self.port.poll(ctx, true);
    }

    fn next_deadline(&self) -> Option<Micros> {
        self.port.deadline(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolator::Isolator;
    use crate::signal::{Drive, Edge};
    use crate::timing::KEYBOARD_TIMING;
    use hex_literal::hex;

    fn segment() -> SegmentConfig {
        SegmentConfig::new("lsb,falling,odd".parse().unwrap(), KEYBOARD_TIMING)
    }

    fn run(keyboard: &mut Keyboard, iso: &mut Isolator) -> Vec<(Micros, Drive)> {
        let mut out = Vec::new();
        while let Some(at) = keyboard.next_deadline() {
            let mut ctx = Ctx::new(at, iso);
            keyboard.poll(&mut ctx);
            out.extend(ctx.drives.into_iter().map(|d| (at, d)));
        }
        out
    }

    #[test]
    fn test_keyboard_sends_in_order() {
        let mut iso = Isolator::new();
        let mut keyboard = Keyboard::new(segment());
        keyboard.send(&hex!("41 42"));
        let drives = run(&mut keyboard, &mut iso);

        let sent: Vec<u8> = keyboard.sent().iter().map(|&(b, _)| b).collect();
        assert_eq!(sent, hex!("41 42"));
        // two start conditions, the second after the inter-frame gap
        let starts: Vec<Micros> = drives
            .iter()
            .filter(|(_, d)| d.pin == KBD_DATA && d.level == Level::Low)
            .map(|&(at, _)| at)
            .collect();
        assert_eq!(starts[0], 0);
        assert!(starts.iter().any(|&at| at >= keyboard.sent()[0].1 + 200));
    }

    #[test]
    fn test_keyboard_stall_is_not_sent() {
        let mut iso = Isolator::new();
        let mut keyboard = Keyboard::new(segment());
        keyboard.stall_after(3, 5_000);
        keyboard.send(&[0x41]);
        let drives = run(&mut keyboard, &mut iso);
        assert!(keyboard.sent().is_empty());
        let clocks = drives
            .iter()
            .filter(|(_, d)| d.pin == KBD_CLOCK && d.level == Level::Low)
            .count();
        assert_eq!(clocks, 3);
    }

    #[test]
    fn test_keyboard_gives_way_to_command() {
        let mut iso = Isolator::new();
        let mut keyboard = Keyboard::new(segment());
        keyboard.send(&[0x41]);

        {
            let mut ctx = Ctx::new(0, &mut iso);
            keyboard.poll(&mut ctx);
            assert_eq!(ctx.drives[0], Drive { pin: KBD_DATA, level: Level::Low });
            // the bridge pulled data at the same instant
            keyboard.on_edge(PinEvent::new(KBD_DATA, Edge::Falling, 0), &mut ctx);
            assert_eq!(ctx.drives.last(), Some(&Drive { pin: KBD_DATA, level: Level::High }));
            assert_eq!(keyboard.port.outbox, [0x41]);
            assert!(keyboard.port.tx.is_none());

            // held lines keep the keyboard off the segment until released
            assert_eq!(keyboard.port.start_at(), None);
            keyboard.on_edge(PinEvent::new(KBD_DATA, Edge::Rising, 50), &mut ctx);
        }
        run(&mut keyboard, &mut iso);
        let sent: Vec<u8> = keyboard.sent().iter().map(|&(b, _)| b).collect();
        assert_eq!(sent, [0x41]);
    }

    #[test]
    fn test_keyboard_acknowledges_commands() {
        let mut iso = Isolator::new();
        let mut keyboard = Keyboard::new(segment());
        let codec = segment().codec;
        let frame = codec.encode(Direction::HostToKeyboard, 0xED).unwrap();

        let mut ctx = Ctx::new(0, &mut iso);
        keyboard.on_edge(PinEvent::new(KBD_DATA, Edge::Falling, 0), &mut ctx);
        let mut data = Level::Low;
        let mut at = 0;
        for bit in frame.iter() {
            at += 100;
            if let Some(edge) = Edge::between(data, bit.into()) {
                keyboard.on_edge(PinEvent::new(KBD_DATA, edge, at), &mut ctx);
                data = bit.into();
            }
            keyboard.on_edge(PinEvent::new(KBD_CLOCK, Edge::Falling, at + 10), &mut ctx);
            keyboard.on_edge(PinEvent::new(KBD_CLOCK, Edge::Rising, at + 50), &mut ctx);
        }
        assert_eq!(keyboard.received(), &[(0xED, 910)]);
        assert_eq!(keyboard.next_deadline(), Some(1_010));

        let drives = run(&mut keyboard, &mut iso);
        assert_eq!(
            drives,
            vec![
                (1_010, Drive { pin: KBD_IRQ, level: Level::High }),
                (1_110, Drive { pin: KBD_IRQ, level: Level::Low }),
            ]
        );
    }
}
