use std::collections::VecDeque;

use tracing::trace;

use crate::codec::BitCodec;
use crate::frame::BitFrame;
use crate::relay::receiver::SegmentLines;
use crate::signal::{Drive, Level, Micros};
use crate::timing::SegmentTiming;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepKind {
    Request,
    Data,
    Sample,
    ClockIdle,
    Release,
}

#[derive(Debug, Clone, Copy)]
struct Step {
    at: Micros,
    kind: StepKind,
    drive: Drive,
}

/// Precomputed drive schedule for one outgoing frame.
///
/// The request goes active at `start`, each bit's data is presented `setup`
/// before the sampling edge, and the clock returns to idle half a bit later.
/// The data line is released high after the last bit and a dedicated request
/// line follows `setup` later.
#[derive(Debug)]
pub struct FrameTransmitter {
    lines: SegmentLines,
    clock_idle: Level,
    starts_at: Micros,
    steps: VecDeque<Step>,
    ends_at: Micros,
}

impl FrameTransmitter {
    pub fn new(
        lines: SegmentLines,
        codec: &BitCodec,
        timing: &SegmentTiming,
        frame: &BitFrame,
        start: Micros,
    ) -> Self {
        let clock_idle = codec.clock_edge.idle_level();
        let sample = codec.clock_edge.level();
        let mut steps = VecDeque::with_capacity(frame.len() as usize * 3 + 3);
        let mut step = |at, kind, pin, level| {
            steps.push_back(Step {
                at,
                kind,
                drive: Drive { pin, level },
            })
        };

        step(start, StepKind::Request, lines.request, lines.request_active);
        let mut t = start + timing.setup;
        for bit in frame.iter() {
            step(t, StepKind::Data, lines.data, Level::from(bit));
            step(t + timing.setup, StepKind::Sample, lines.clock, sample);
            step(t + timing.bit_period / 2, StepKind::ClockIdle, lines.clock, clock_idle);
            t += timing.bit_period;
        }
        step(t, StepKind::Release, lines.data, Level::High);
        if !lines.shares_request() {
            let idle = lines.request_active.inverted();
            step(t + timing.setup, StepKind::Release, lines.request, idle);
        }

        trace!("TX: {frame:?} from {start} to {}", t + timing.setup);
        Self {
            lines,
            clock_idle,
            starts_at: start,
            steps,
            ends_at: t + timing.setup,
        }
    }

    /// Push every drive due at or before `now`.
    pub fn due(&mut self, now: Micros, drives: &mut Vec<Drive>) {
        while let Some(step) = self.steps.front() {
            if step.at > now {
                break;
            }
            drives.push(step.drive);
            self.steps.pop_front();
        }
    }

    pub fn next_at(&self) -> Option<Micros> {
        self.steps.front().map(|s| s.at)
    }

    pub fn is_done(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn ends_at(&self) -> Micros {
        self.ends_at
    }

    pub fn starts_at(&self) -> Micros {
        self.starts_at
    }

    pub fn lines(&self) -> &SegmentLines {
        &self.lines
    }

    /// Stop clocking after `bits` bits and hold the lines for `stall` before
    /// releasing them, leaving the frame unfinished.
    pub fn stall_after(&mut self, bits: usize, stall: Micros) {
        let cut = if bits == 0 {
            self.steps.front().map(|s| (0, s.at))
        } else {
            self.steps
                .iter()
                .enumerate()
                .filter(|(_, s)| s.kind == StepKind::ClockIdle)
                .nth(bits - 1)
                .map(|(i, s)| (i, s.at))
        };
        let Some((index, at)) = cut else {
            return;
        };
        let release: Vec<Step> = self
            .steps
            .drain(index + 1..)
            .filter(|s| s.kind == StepKind::Release)
            .enumerate()
            .map(|(i, s)| Step {
                at: at + stall + i as Micros,
                ..s
            })
            .collect();
        self.ends_at = release.last().map_or(at + stall, |s| s.at);
        self.steps.extend(release);
    }

    /// Return every line to idle.
    pub fn abort(&mut self, drives: &mut Vec<Drive>) {
        self.steps.clear();
        drives.push(Drive {
            pin: self.lines.clock,
            level: self.clock_idle,
        });
        drives.push(Drive {
            pin: self.lines.data,
            level: Level::High,
        });
        if !self.lines.shares_request() {
            drives.push(Drive {
                pin: self.lines.request,
                level: self.lines.request_active.inverted(),
            });
        }
    }
}
