//! Deterministic event loop wiring the two engines to each other and to the
//! simulated keyboard and host.
//!
//! Everything runs on one thread. Each net rests at its idle level and goes
//! active while any party on it drives the active level, so a party letting
//! go of a line someone else holds changes nothing. When a net does change,
//! every *other* endpoint on it sees the edge. Endpoints ask to be woken at
//! their next deadline. Items that fall due at the same
//! microsecond run in the order they were scheduled.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use tracing::{debug, trace};

use crate::config::BridgeConfig;
use crate::engine::{DownstreamEngine, UpstreamEngine};
use crate::error::{ConfigError, RelayError};
use crate::intercept::InterceptionPolicy;
use crate::isolator::Isolator;
use crate::pins::Role;
use crate::relay::{Ctx, Endpoint};
use crate::signal::{Drive, Edge, Level, Micros, PinEvent, PinId};
use crate::sim::{self, Host, Keyboard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Party {
    Keyboard,
    Upstream,
    Downstream,
    Host,
}

#[derive(Debug)]
struct Net {
    name: &'static str,
    pins: [(Party, PinId); 2],
    idle: Level,
    level: Level,
}

impl Net {
    fn new(name: &'static str, pins: [(Party, PinId); 2], idle: Level) -> Self {
        Self {
            name,
            pins,
            idle,
            level: idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Item {
    Drive(Party, Drive),
    Wake(Party),
}

#[derive(Debug, PartialEq, Eq)]
struct Scheduled {
    at: Micros,
    seq: u64,
    item: Item,
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; earliest (at, seq) first
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct Bridge {
    now: Micros,
    seq: u64,
    queue: BinaryHeap<Scheduled>,
    wakes: HashSet<(Party, Micros)>,
    nets: Vec<Net>,
    net_of: HashMap<(Party, PinId), usize>,
    isolator_net: usize,
    driven: HashMap<(Party, PinId), Level>,
    peak_isolator_drivers: usize,
    isolator: Isolator,
    upstream: UpstreamEngine,
    downstream: DownstreamEngine,
    keyboard: Keyboard,
    host: Host,
}

impl Bridge {
    pub fn new(
        config: &BridgeConfig,
        policy: Box<dyn InterceptionPolicy>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let up = &config.keyboard_pins;
        let down = &config.feeder_pins;

        let upstream = UpstreamEngine::new(up, config.keyboard, config.link)?;
        let downstream = DownstreamEngine::new(
            down,
            config.link,
            config.host,
            config.addresses,
            policy,
        )?;

        let kbd_clock_idle = config.keyboard.codec.clock_edge.idle_level();
        let link_clock_idle = config.link.codec.clock_edge.idle_level();
        let bus_clock_idle = config.host.codec.clock_edge.idle_level();
        let nets = vec![
            Net::new(
                "kbd-data",
                [
                    (Party::Keyboard, sim::KBD_DATA),
                    (Party::Upstream, up.require(Role::DataRequestIn)?),
                ],
                Level::High,
            ),
            Net::new(
                "kbd-clock",
                [
                    (Party::Keyboard, sim::KBD_CLOCK),
                    (Party::Upstream, up.require(Role::ClockIn)?),
                ],
                kbd_clock_idle,
            ),
            Net::new(
                "kbd-irq",
                [
                    (Party::Keyboard, sim::KBD_IRQ),
                    (Party::Upstream, up.require(Role::PeripheralIrqIn)?),
                ],
                Level::Low,
            ),
            Net::new(
                "link-clock",
                [
                    (Party::Upstream, up.require(Role::IrqOut)?),
                    (Party::Downstream, down.require(Role::ClockIn)?),
                ],
                link_clock_idle,
            ),
            Net::new(
                "link-data",
                [
                    (Party::Upstream, up.require(Role::DataOut)?),
                    (Party::Downstream, down.require(Role::DataIn)?),
                ],
                Level::High,
            ),
            Net::new(
                "isolator",
                [
                    (Party::Upstream, up.require(Role::IsolatorEnable)?),
                    (Party::Downstream, down.require(Role::IsolatorEnable)?),
                ],
                Level::Low,
            ),
            Net::new(
                "host-irq",
                [
                    (Party::Downstream, down.require(Role::IrqOut)?),
                    (Party::Host, sim::HOST_IRQ),
                ],
                Level::Low,
            ),
            Net::new(
                "bus-clock",
                [
                    (Party::Downstream, down.require(Role::BusClock)?),
                    (Party::Host, sim::HOST_CLOCK),
                ],
                bus_clock_idle,
            ),
            Net::new(
                "bus-data",
                [
                    (Party::Downstream, down.require(Role::BusData)?),
                    (Party::Host, sim::HOST_DATA),
                ],
                Level::High,
            ),
        ];
        let isolator_net = 5;

        let mut net_of = HashMap::new();
        for (i, net) in nets.iter().enumerate() {
            for &endpoint in &net.pins {
                net_of.insert(endpoint, i);
            }
        }

        Ok(Self {
            now: 0,
            seq: 0,
            queue: BinaryHeap::new(),
            wakes: HashSet::new(),
            nets,
            net_of,
            isolator_net,
            driven: HashMap::new(),
            peak_isolator_drivers: 0,
            isolator: Isolator::new(),
            upstream,
            downstream,
            keyboard: Keyboard::new(config.keyboard),
            host: Host::new(config.host),
        })
    }

    pub fn now(&self) -> Micros {
        self.now
    }

    pub fn keyboard_send(&mut self, bytes: &[u8]) {
        self.keyboard.send(bytes);
        self.arm(Party::Keyboard);
    }

    pub fn host_send(&mut self, bytes: &[u8]) {
        self.host.send(bytes);
        self.arm(Party::Host);
    }

    /// The keyboard abandons its next frame after `bits` bits.
    pub fn stall_keyboard_after(&mut self, bits: usize, stall: Micros) {
        self.keyboard.stall_after(bits, stall);
    }

    pub fn set_keyboard_acknowledge(&mut self, acknowledge: bool) {
        self.keyboard.set_acknowledge(acknowledge);
    }

    pub fn select_address(&mut self, index: usize) -> Result<u8, RelayError> {
        let mut ctx = Ctx::new(self.now, &mut self.isolator);
        let result = self.downstream.select_address(index, &mut ctx);
        let drives = ctx.drives;
        self.settle(Party::Downstream, drives);
        result
    }

    pub fn inject(&mut self, byte: u8) {
        self.downstream.inject(byte);
        self.arm(Party::Downstream);
    }

    /// Run until nothing is scheduled.
    pub fn run_until_idle(&mut self) -> Micros {
        while let Some(next) = self.queue.pop() {
            self.dispatch(next);
        }
        self.now
    }

    /// Run everything due in the next `duration` microseconds.
    pub fn run_for(&mut self, duration: Micros) -> Micros {
        let end = self.now + duration;
        while self.queue.peek().is_some_and(|s| s.at <= end) {
            if let Some(next) = self.queue.pop() {
                self.dispatch(next);
            }
        }
        self.now = end;
        self.now
    }

    pub fn host_received(&self) -> &[(u8, Micros)] {
        self.host.received()
    }

    pub fn host_sent(&self) -> &[(u8, Micros)] {
        self.host.sent()
    }

    pub fn keyboard_received(&self) -> &[(u8, Micros)] {
        self.keyboard.received()
    }

    pub fn keyboard_sent(&self) -> &[(u8, Micros)] {
        self.keyboard.sent()
    }

    pub fn upstream(&self) -> &UpstreamEngine {
        &self.upstream
    }

    pub fn downstream(&self) -> &DownstreamEngine {
        &self.downstream
    }

    pub fn isolator(&self) -> &Isolator {
        &self.isolator
    }

    /// Most parties ever seen driving isolator-enable high at once.
    pub fn peak_isolator_drivers(&self) -> usize {
        self.peak_isolator_drivers
    }

    /// Level of a party's pin: the net level if wired, else what the party
    /// last drove.
    pub fn level(&self, party: Party, pin: PinId) -> Level {
        match self.net_of.get(&(party, pin)) {
            Some(&net) => self.nets[net].level,
            None => self.driven.get(&(party, pin)).copied().unwrap_or_default(),
        }
    }

    fn schedule(&mut self, at: Micros, item: Item) {
        self.seq += 1;
        self.queue.push(Scheduled {
            at,
            seq: self.seq,
            item,
        });
    }

    /// Queue a wake-up at the party's next deadline.
    fn arm(&mut self, party: Party) {
        let deadline = match party {
            Party::Keyboard => self.keyboard.next_deadline(),
            Party::Upstream => self.upstream.next_deadline(),
            Party::Downstream => self.downstream.next_deadline(),
            Party::Host => self.host.next_deadline(),
        };
        if let Some(at) = deadline {
            let at = at.max(self.now);
            if self.wakes.insert((party, at)) {
                self.schedule(at, Item::Wake(party));
            }
        }
    }

    /// Queue a party's drives at the current time and re-arm it.
    fn settle(&mut self, party: Party, drives: Vec<Drive>) {
        for drive in drives {
            self.schedule(self.now, Item::Drive(party, drive));
        }
        self.arm(party);
    }

    fn call(&mut self, party: Party, event: Option<PinEvent>) {
        let mut ctx = Ctx::new(self.now, &mut self.isolator);
        let endpoint: &mut dyn Endpoint = match party {
            Party::Keyboard => &mut self.keyboard,
            Party::Upstream => &mut self.upstream,
            Party::Downstream => &mut self.downstream,
            Party::Host => &mut self.host,
        };
        match event {
            Some(event) => endpoint.on_edge(event, &mut ctx),
            None => endpoint.poll(&mut ctx),
        }
        let drives = ctx.drives;
        self.settle(party, drives);
    }

    fn dispatch(&mut self, next: Scheduled) {
        debug_assert!(next.at >= self.now);
        self.now = next.at;
        match next.item {
            Item::Wake(party) => {
                self.wakes.remove(&(party, next.at));
                self.call(party, None);
            }
            Item::Drive(party, drive) => self.apply(party, drive),
        }
    }

    fn apply(&mut self, party: Party, drive: Drive) {
        self.driven.insert((party, drive.pin), drive.level);
        let Some(&index) = self.net_of.get(&(party, drive.pin)) else {
            trace!("BRIDGE: {party:?} pin {} {:?}", drive.pin, drive.level);
            return;
        };

        if index == self.isolator_net {
            let drivers = self.nets[index]
                .pins
                .iter()
                .filter(|&&key| self.driven.get(&key) == Some(&Level::High))
                .count();
            if drivers > self.peak_isolator_drivers {
                debug!("BRIDGE: {drivers} isolator driver(s) at {}", self.now);
                self.peak_isolator_drivers = drivers;
            }
        }

        let net = &self.nets[index];
        let active = net.idle.inverted();
        let held = net
            .pins
            .iter()
            .any(|key| self.driven.get(key) == Some(&active));
        let level = if held { active } else { net.idle };
        let net = &mut self.nets[index];
        let Some(edge) = Edge::between(net.level, level) else {
            return;
        };
        net.level = level;
        trace!("BRIDGE: {} {edge} by {party:?} at {}", net.name, self.now);

        let others: Vec<(Party, PinId)> = net
            .pins
            .iter()
            .copied()
            .filter(|&(p, _)| p != party)
            .collect();
        for (other, pin) in others {
            self.call(other, Some(PinEvent::new(pin, edge, self.now)));
        }
    }
}
