//! Shared per-engine relay machinery.
//!
//! Both engines are a [`RelayCore`] with two receivers, one per direction.
//! Each receiver owns the lines of one segment and decodes independently of
//! the other. Completed bytes queue up in completion order and go out one
//! [`Transmission`] at a time on the *other* segment, once its far end has
//! released the lines. The engines decide what a completed byte becomes;
//! the core does everything else.

pub mod receiver;
pub mod transmitter;

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use crate::error::RelayError;
use crate::frame::Direction;
use crate::isolator::{Isolator, IsolatorToken};
use crate::signal::{Drive, Edge, Level, Micros, PinEvent, PinId};

pub use receiver::{FrameReceiver, Sample, SegmentLines};
pub use transmitter::FrameTransmitter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    AwaitingRequest,
    ClockingIn,
    /// Bytes queued, clocking one out, or waiting for its acknowledge.
    Forwarding,
    /// Only left through a valid address selection.
    Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayStats {
    pub received: usize,
    pub forwarded: usize,
    pub modified: usize,
    pub suppressed: usize,
    pub injected: usize,
    pub acknowledged: usize,
    /// Completed bytes abandoned before they were clocked out.
    pub dropped: usize,
    /// Outgoing frames restarted after losing a start race.
    pub yielded: usize,
    pub timeouts: usize,
    pub ack_timeouts: usize,
    pub violations: usize,
    pub contentions: usize,
    pub rejected: usize,
}

/// What an endpoint may touch while handling one call.
pub struct Ctx<'a> {
    pub now: Micros,
    pub isolator: &'a mut Isolator,
    pub drives: Vec<Drive>,
}

impl<'a> Ctx<'a> {
    pub fn new(now: Micros, isolator: &'a mut Isolator) -> Self {
        Self {
            now,
            isolator,
            drives: Vec::new(),
        }
    }

    pub fn drive(&mut self, pin: PinId, level: Level) {
        self.drives.push(Drive { pin, level });
    }

    /// Hand the token back and drain isolator-enable.
    pub fn release(&mut self, token: IsolatorToken) {
        let drive = self.isolator.release(token);
        self.drives.push(drive);
    }
}

/// Anything attached to the wiring.
pub trait Endpoint {
    /// An edge on one of this endpoint's pins, driven by someone else.
    fn on_edge(&mut self, event: PinEvent, ctx: &mut Ctx);
    /// Called at or after the time returned by `next_deadline`.
    fn poll(&mut self, ctx: &mut Ctx);
    fn next_deadline(&self) -> Option<Micros>;
}

/// An outgoing frame plus whatever it holds until it is done.
#[derive(Debug)]
pub struct Transmission {
    direction: Direction,
    byte: u8,
    tx: FrameTransmitter,
    token: Option<IsolatorToken>,
    /// Acknowledge pin and how long to wait for it after the frame ends.
    ack: Option<(PinId, Micros)>,
    acked: bool,
}

impl Transmission {
    pub fn new(direction: Direction, byte: u8, tx: FrameTransmitter) -> Self {
        Self {
            direction,
            byte,
            tx,
            token: None,
            ack: None,
            acked: false,
        }
    }

    /// Keep the isolator token until the frame has been clocked out.
    pub fn holding(mut self, token: IsolatorToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn acknowledged_on(mut self, pin: PinId, timeout: Micros) -> Self {
        self.ack = Some((pin, timeout));
        self
    }

    /// A start condition seen at `at` beats ours if the far end cannot have
    /// seen ours yet: the request doubles as data and went out this instant.
    fn loses_race_at(&self, at: Micros) -> bool {
        self.tx.lines().shares_request() && self.tx.starts_at() == at
    }
}

#[derive(Debug)]
pub struct RelayCore {
    name: &'static str,
    status: PinId,
    isolator_pin: PinId,
    status_high: bool,
    halted: bool,
    receivers: [FrameReceiver; 2],
    queue: VecDeque<(Direction, u8)>,
    tx: Option<Transmission>,
    ack_wait: Option<(PinId, Micros)>,
    retry_at: Option<Micros>,
    stats: RelayStats,
    last_fault: Option<RelayError>,
}

impl RelayCore {
    pub fn new(
        name: &'static str,
        status: PinId,
        isolator_pin: PinId,
        receivers: [FrameReceiver; 2],
    ) -> Self {
        debug_assert_ne!(receivers[0].direction(), receivers[1].direction());
        Self {
            name,
            status,
            isolator_pin,
            status_high: false,
            halted: false,
            receivers,
            queue: VecDeque::new(),
            tx: None,
            ack_wait: None,
            retry_at: None,
            stats: RelayStats::default(),
            last_fault: None,
        }
    }

    pub fn phase(&self) -> Phase {
        if self.halted {
            return Phase::Fault;
        }
        if self.tx.is_some() || self.ack_wait.is_some() || !self.queue.is_empty() {
            return Phase::Forwarding;
        }
        let frames = || self.receivers.iter().filter_map(|rx| rx.frame());
        if frames().any(|f| !f.is_empty()) {
            Phase::ClockingIn
        } else if frames().next().is_some() {
            Phase::AwaitingRequest
        } else {
            Phase::Idle
        }
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut RelayStats {
        &mut self.stats
    }

    pub fn last_fault(&self) -> Option<RelayError> {
        self.last_fault
    }

    pub fn is_idle(&self) -> bool {
        self.phase() == Phase::Idle
    }

    /// Nothing queued or in flight outbound, and not halted.
    pub fn is_ready(&self) -> bool {
        !self.halted && self.tx.is_none() && self.ack_wait.is_none() && self.queue.is_empty()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Receiver whose lines carry bytes travelling in `direction`.
    fn segment_for(&self, direction: Direction) -> Option<usize> {
        self.receivers.iter().position(|rx| rx.direction() != direction)
    }

    /// Returns a completed inbound byte for the engine to route.
    pub fn on_edge(&mut self, event: PinEvent, ctx: &mut Ctx) -> Option<(Direction, u8)> {
        trace!("{}: pin {} {} at {}", self.name, event.pin, event.edge, event.at);

        if event.pin == self.isolator_pin
            && event.edge == Edge::Rising
            && self.tx.as_ref().is_some_and(|t| t.token.is_some())
        {
            self.abort_transmission(RelayError::BusContention, ctx);
            return None;
        }

        if event.edge == Edge::Rising {
            if let Some(t) = self.tx.as_mut().filter(|t| t.ack.is_some_and(|(p, _)| p == event.pin)) {
                trace!("{}: early acknowledge", self.name);
                t.acked = true;
            }
            if self.ack_wait.is_some_and(|(p, _)| p == event.pin) {
                self.ack_wait = None;
                self.stats.acknowledged += 1;
                debug!("{}: acknowledged at {}", self.name, event.at);
                return None;
            }
        }

        if self.halted {
            for rx in &mut self.receivers {
                rx.observe(&event);
            }
            return None;
        }

        let sending_on = self
            .tx
            .as_ref()
            .and_then(|t| self.segment_for(t.direction));
        let mut completed = None;
        for i in 0..self.receivers.len() {
            if !self.receivers[i].watches(event.pin) {
                continue;
            }
            if sending_on == Some(i) {
                let lost = self.receivers[i].would_arm(&event)
                    && self.tx.as_ref().is_some_and(|t| t.loses_race_at(event.at));
                if !lost {
                    // our own frame owns these lines
                    self.receivers[i].observe(&event);
                    continue;
                }
                self.yield_transmission(ctx);
            }

            match self.receivers[i].on_edge(&event) {
                Ok(Sample::Complete(byte)) => {
                    let direction = self.receivers[i].direction();
                    debug!("{}: {direction} {byte:02X}", self.name);
                    self.stats.received += 1;
                    completed = Some((direction, byte));
                }
                Ok(_) => {}
                Err(err) => self.record(err),
            }
        }
        completed
    }

    pub fn poll(&mut self, ctx: &mut Ctx) {
        for i in 0..self.receivers.len() {
            if let Err(err) = self.receivers[i].expire(ctx.now) {
                self.record(err);
            }
        }
        self.step_tx(ctx);
        if self.ack_wait.is_some_and(|(_, deadline)| ctx.now >= deadline) {
            self.ack_wait = None;
            self.record(RelayError::AckTimeout);
        }
    }

    /// Queue a byte behind everything completed before it.
    pub fn enqueue(&mut self, direction: Direction, byte: u8) {
        trace!("{}: queued {direction} {byte:02X}", self.name);
        self.queue.push_back((direction, byte));
    }

    /// Pop the next queued byte if nothing is outbound and its segment is
    /// free: the far end has released the lines for a full guard time and,
    /// on the link, nobody holds the isolator token.
    pub fn next_ready(&mut self, ctx: &Ctx) -> Option<(Direction, u8)> {
        self.retry_at = None;
        if self.halted || self.tx.is_some() || self.ack_wait.is_some() {
            return None;
        }
        let &(direction, _) = self.queue.front()?;
        let rx = &self.receivers[self.segment_for(direction)?];
        if rx.watches(self.isolator_pin) && ctx.isolator.is_active() {
            trace!("{}: link busy, holding {direction}", self.name);
            return None;
        }
        let quiet = rx.quiet_at()?;
        if quiet > ctx.now {
            self.retry_at = Some(quiet);
            return None;
        }
        self.queue.pop_front()
    }

    /// Start clocking out `tx`.
    pub fn begin(&mut self, tx: Transmission, ctx: &mut Ctx) {
        debug_assert!(self.tx.is_none());
        self.tx = Some(tx);
        self.step_tx(ctx);
    }

    /// Drive the status pin high while anything is in progress.
    pub fn sync_status(&mut self, ctx: &mut Ctx) {
        let busy = !matches!(self.phase(), Phase::Idle | Phase::Fault);
        if busy != self.status_high {
            self.status_high = busy;
            ctx.drive(self.status, Level::from(busy));
        }
    }

    fn step_tx(&mut self, ctx: &mut Ctx) {
        let Some(t) = self.tx.as_mut() else {
            return;
        };
        t.tx.due(ctx.now, &mut ctx.drives);
        if !t.tx.is_done() {
            return;
        }
        let Some(t) = self.tx.take() else {
            return;
        };
        if let Some(token) = t.token {
            ctx.release(token);
        }
        self.stats.forwarded += 1;
        match t.ack {
            Some((pin, timeout)) if !t.acked => {
                trace!("{}: waiting for acknowledge on pin {pin}", self.name);
                self.ack_wait = Some((pin, ctx.now + timeout));
            }
            Some(_) => self.stats.acknowledged += 1,
            None => {}
        }
    }

    /// The far end started a frame in the same instant. Back off and send
    /// this byte again once its frame is in.
    fn yield_transmission(&mut self, ctx: &mut Ctx) {
        let Some(mut t) = self.tx.take() else {
            return;
        };
        debug!("{}: start race lost, requeueing {} {:02X}", self.name, t.direction, t.byte);
        t.tx.abort(&mut ctx.drives);
        if let Some(token) = t.token {
            ctx.release(token);
        }
        self.stats.yielded += 1;
        self.queue.push_front((t.direction, t.byte));
    }

    /// Count and log a fault. Receiver faults have already discarded their
    /// frame.
    fn record(&mut self, err: RelayError) {
        warn!("{}: {err} (in {:?})", self.name, self.phase());
        match err {
            RelayError::FrameTimeout { .. } => self.stats.timeouts += 1,
            RelayError::AckTimeout => self.stats.ack_timeouts += 1,
            RelayError::ProtocolViolation(_) | RelayError::ValueTooWide { .. } => {
                self.stats.violations += 1
            }
            RelayError::BusContention => self.stats.contentions += 1,
            RelayError::AddressRejected { .. } => self.stats.rejected += 1,
        }
        self.last_fault = Some(err);
    }

    /// A queued byte could not be turned into a frame.
    pub fn discard(&mut self, err: RelayError) {
        self.record(err);
        self.stats.dropped += 1;
    }

    /// Abandon the outgoing frame and drain its lines. Inbound frames and
    /// the queue are untouched.
    pub fn abort_transmission(&mut self, err: RelayError, ctx: &mut Ctx) {
        self.record(err);
        if let Some(mut t) = self.tx.take() {
            t.tx.abort(&mut ctx.drives);
            if let Some(token) = t.token {
                ctx.release(token);
            }
            self.stats.dropped += 1;
        }
        self.ack_wait = None;
    }

    /// Abandon everything in flight and ignore traffic until
    /// [`RelayCore::clear_fault`]. Queued bytes wait.
    pub fn halt(&mut self, err: RelayError, ctx: &mut Ctx) {
        self.abort_transmission(err, ctx);
        for rx in &mut self.receivers {
            rx.abort();
        }
        self.halted = true;
        self.sync_status(ctx);
    }

    pub fn clear_fault(&mut self) {
        if self.halted {
            debug!("{}: fault cleared", self.name);
            self.halted = false;
        }
    }

    pub fn deadline(&self) -> Option<Micros> {
        let rx = self.receivers.iter().filter_map(|rx| rx.deadline()).min();
        let tx = self.tx.as_ref().and_then(|t| t.tx.next_at());
        let ack = self.ack_wait.map(|(_, deadline)| deadline);
        [rx, tx, ack, self.retry_at].into_iter().flatten().min()
    }
}
