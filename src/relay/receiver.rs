use tracing::trace;

use crate::codec::BitCodec;
use crate::error::{RelayError, Violation};
use crate::frame::{BitFrame, Direction};
use crate::isolator::IsolatorToken;
use crate::signal::{Level, Micros, PinEvent, PinId};

/// The three lines of one segment, as seen from one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLines {
    /// Moving to `request_active` starts a frame.
    pub request: PinId,
    pub request_active: Level,
    pub clock: PinId,
    pub data: PinId,
}

impl SegmentLines {
    /// Data line doubles as the request: it idles high and its falling edge
    /// is the start condition.
    pub fn start_bit(data: PinId, clock: PinId) -> Self {
        Self {
            request: data,
            request_active: Level::Low,
            clock,
            data,
        }
    }

    /// A dedicated request line (IRQ or isolator-enable), active high.
    pub fn requested(request: PinId, clock: PinId, data: PinId) -> Self {
        Self {
            request,
            request_active: Level::High,
            clock,
            data,
        }
    }

    /// Link lines for the holder of the isolator token.
    pub fn link(token: &IsolatorToken, clock: PinId, data: PinId) -> Self {
        Self::requested(token.pin(), clock, data)
    }

    pub fn shares_request(&self) -> bool {
        self.request == self.data
    }

    pub fn contains(&self, pin: PinId) -> bool {
        pin == self.request || pin == self.clock || pin == self.data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    Ignored,
    Armed,
    Bit,
    Complete(u8),
}

/// Edge-driven frame decoder. Every call does a bounded amount of work.
#[derive(Debug)]
pub struct FrameReceiver {
    direction: Direction,
    lines: SegmentLines,
    codec: BitCodec,
    timeout: Micros,
    /// How long the lines must rest before this end may drive them.
    guard: Micros,
    request_level: Level,
    data_level: Level,
    clock_level: Level,
    last_seen: Option<Micros>,
    frame: Option<BitFrame>,
}

impl FrameReceiver {
    pub fn new(direction: Direction, lines: SegmentLines, codec: BitCodec, timeout: Micros) -> Self {
        Self {
            direction,
            lines,
            codec,
            timeout,
            guard: 0,
            request_level: lines.request_active.inverted(),
            data_level: Level::High,
            clock_level: codec.clock_edge.idle_level(),
            last_seen: None,
            frame: None,
        }
    }

    pub fn with_guard(mut self, guard: Micros) -> Self {
        self.guard = guard;
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn watches(&self, pin: PinId) -> bool {
        self.lines.contains(pin)
    }

    pub fn is_busy(&self) -> bool {
        self.frame.is_some()
    }

    pub fn frame(&self) -> Option<&BitFrame> {
        self.frame.as_ref()
    }

    /// Would this edge start a frame?
    pub fn would_arm(&self, event: &PinEvent) -> bool {
        self.frame.is_none()
            && event.pin == self.lines.request
            && event.level() == self.lines.request_active
    }

    /// Track the lines without sampling.
    pub fn observe(&mut self, event: &PinEvent) {
        if !self.lines.contains(event.pin) {
            return;
        }
        self.last_seen = Some(event.at);
        if event.pin == self.lines.request {
            self.request_level = event.level();
        }
        if event.pin == self.lines.data {
            self.data_level = event.level();
        }
        if event.pin == self.lines.clock {
            self.clock_level = event.level();
        }
    }

    /// Earliest time the far end's lines count as released, or `None` while
    /// a frame is in progress or a line is still held.
    pub fn quiet_at(&self) -> Option<Micros> {
        let idle = !self.is_busy()
            && self.request_level != self.lines.request_active
            && self.data_level == Level::High
            && self.clock_level == self.codec.clock_edge.idle_level();
        idle.then(|| self.last_seen.map_or(0, |at| at + self.guard))
    }

    pub fn on_edge(&mut self, event: &PinEvent) -> Result<Sample, RelayError> {
        self.observe(event);

        let Some(mut frame) = self.frame.take() else {
            if self.would_arm(event) {
                trace!("RX {}: armed at {}", self.direction, event.at);
                self.frame = Some(BitFrame::new(self.direction, event.at));
                return Ok(Sample::Armed);
            }
            return Ok(Sample::Ignored);
        };

        if event.at.saturating_sub(frame.last_edge) > self.timeout {
            return Err(self.timed_out(&frame));
        }

        if event.pin == self.lines.clock {
            if event.edge != self.codec.clock_edge {
                frame.touch(event.at);
                self.frame = Some(frame);
                return Ok(Sample::Ignored);
            }
            frame.push(self.data_level.is_high(), event.at);
            if frame.len() < self.codec.frame_bits() {
                self.frame = Some(frame);
                return Ok(Sample::Bit);
            }
            trace!("RX {}: {:?}", self.direction, frame);
            return self.codec.decode(&frame).map(Sample::Complete);
        }

        if event.pin == self.lines.request
            && !self.lines.shares_request()
            && event.level() != self.lines.request_active
        {
            return Err(Violation::RequestWithdrawn.into());
        }

        frame.touch(event.at);
        self.frame = Some(frame);
        Ok(Sample::Ignored)
    }

    /// Discard the frame if its last edge is older than the timeout.
    pub fn expire(&mut self, now: Micros) -> Result<(), RelayError> {
        let Some(frame) = self.frame else {
            return Ok(());
        };
        if now.saturating_sub(frame.last_edge) <= self.timeout {
            return Ok(());
        }
        self.frame = None;
        Err(self.timed_out(&frame))
    }

    pub fn deadline(&self) -> Option<Micros> {
        self.frame.map(|f| f.last_edge + self.timeout + 1)
    }

    pub fn abort(&mut self) -> Option<BitFrame> {
        self.frame.take()
    }

    fn timed_out(&self, frame: &BitFrame) -> RelayError {
        RelayError::FrameTimeout {
            bits: frame.len(),
            expected: self.codec.frame_bits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BitOrder, Parity};
    use crate::signal::Edge;

    const DATA: PinId = 3;
    const CLOCK: PinId = 4;
    const IRQ: PinId = 6;

    fn codec() -> BitCodec {
        BitCodec::new(BitOrder::LsbFirst, Edge::Falling, Parity::Odd)
    }

    /// Feed a well-formed start-bit frame, returning the final sample.
    fn clock_in(rx: &mut FrameReceiver, value: u8, mut at: Micros) -> Result<Sample, RelayError> {
        let frame = codec().encode(Direction::KeyboardToHost, value).unwrap();
        assert_eq!(
            rx.on_edge(&PinEvent::new(DATA, Edge::Falling, at))?,
            Sample::Armed
        );
        let mut data = Level::Low;
        let mut last = Sample::Ignored;
        for bit in frame.iter() {
            at += 10;
            let level = Level::from(bit);
            if let Some(edge) = Edge::between(data, level) {
                rx.on_edge(&PinEvent::new(DATA, edge, at))?;
                data = level;
            }
            last = rx.on_edge(&PinEvent::new(CLOCK, Edge::Falling, at + 5))?;
            rx.on_edge(&PinEvent::new(CLOCK, Edge::Rising, at + 8))?;
        }
        Ok(last)
    }

    #[test]
    fn test_receives_frame() {
        let mut rx = FrameReceiver::new(
            Direction::KeyboardToHost,
            SegmentLines::start_bit(DATA, CLOCK),
            codec(),
            100,
        );
        assert_eq!(clock_in(&mut rx, 0x41, 1000), Ok(Sample::Complete(0x41)));
        assert!(!rx.is_busy());
    }

    #[test]
    fn test_stray_clock_ignored_when_idle() {
        let mut rx = FrameReceiver::new(
            Direction::KeyboardToHost,
            SegmentLines::start_bit(DATA, CLOCK),
            codec(),
            100,
        );
        assert_eq!(
            rx.on_edge(&PinEvent::new(CLOCK, Edge::Falling, 5)),
            Ok(Sample::Ignored)
        );
        assert!(!rx.is_busy());
    }

    #[test]
    fn test_timeout_discards_partial_frame() {
        let mut rx = FrameReceiver::new(
            Direction::KeyboardToHost,
            SegmentLines::start_bit(DATA, CLOCK),
            codec(),
            100,
        );
        rx.on_edge(&PinEvent::new(DATA, Edge::Falling, 0)).unwrap();
        rx.on_edge(&PinEvent::new(CLOCK, Edge::Falling, 10)).unwrap();
        assert_eq!(rx.deadline(), Some(111));
        assert_eq!(rx.expire(110), Ok(()));
        assert_eq!(
            rx.expire(111),
            Err(RelayError::FrameTimeout {
                bits: 1,
                expected: 9
            })
        );
        assert!(!rx.is_busy());
        assert_eq!(rx.deadline(), None);
    }

    #[test]
    fn test_late_edge_times_out() {
        let mut rx = FrameReceiver::new(
            Direction::KeyboardToHost,
            SegmentLines::start_bit(DATA, CLOCK),
            codec(),
            100,
        );
        rx.on_edge(&PinEvent::new(DATA, Edge::Falling, 0)).unwrap();
        assert!(matches!(
            rx.on_edge(&PinEvent::new(CLOCK, Edge::Falling, 500)),
            Err(RelayError::FrameTimeout { bits: 0, .. })
        ));
    }

    #[test]
    fn test_request_withdrawn() {
        let mut rx = FrameReceiver::new(
            Direction::KeyboardToHost,
            SegmentLines::requested(IRQ, CLOCK, DATA),
            codec(),
            100,
        );
        assert_eq!(
            rx.on_edge(&PinEvent::new(IRQ, Edge::Rising, 0)),
            Ok(Sample::Armed)
        );
        assert_eq!(
            rx.on_edge(&PinEvent::new(CLOCK, Edge::Falling, 5)),
            Ok(Sample::Bit)
        );
        assert_eq!(
            rx.on_edge(&PinEvent::new(IRQ, Edge::Falling, 10)),
            Err(RelayError::ProtocolViolation(Violation::RequestWithdrawn))
        );
        assert!(!rx.is_busy());
    }

    #[test]
    fn test_quiet_once_lines_released() {
        let mut rx = FrameReceiver::new(
            Direction::KeyboardToHost,
            SegmentLines::requested(IRQ, CLOCK, DATA),
            codec(),
            100,
        )
        .with_guard(20);
        assert_eq!(rx.quiet_at(), Some(0));
        rx.on_edge(&PinEvent::new(IRQ, Edge::Rising, 50)).unwrap();
        assert_eq!(rx.quiet_at(), None);
        rx.abort();
        // request still held
        assert_eq!(rx.quiet_at(), None);
        rx.on_edge(&PinEvent::new(CLOCK, Edge::Falling, 60)).unwrap();
        assert_eq!(rx.quiet_at(), None);
        rx.on_edge(&PinEvent::new(IRQ, Edge::Falling, 70)).unwrap();
        rx.on_edge(&PinEvent::new(CLOCK, Edge::Rising, 75)).unwrap();
        assert_eq!(rx.quiet_at(), Some(95));
    }

    #[test]
    fn test_parity_error_discards() {
        let mut rx = FrameReceiver::new(
            Direction::KeyboardToHost,
            SegmentLines::requested(IRQ, CLOCK, DATA),
            BitCodec::new(BitOrder::LsbFirst, Edge::Falling, Parity::Even),
            100,
        );
        rx.on_edge(&PinEvent::new(IRQ, Edge::Rising, 0)).unwrap();
        // data idles high: nine ones, even parity wants the ninth low
        let mut last = Ok(Sample::Ignored);
        for i in 0..9 {
            last = rx.on_edge(&PinEvent::new(CLOCK, Edge::Falling, 10 + i * 10));
        }
        assert_eq!(
            last,
            Err(RelayError::ProtocolViolation(Violation::Parity))
        );
        assert!(!rx.is_busy());
    }
}
