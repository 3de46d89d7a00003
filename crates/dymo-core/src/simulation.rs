//! Multi-Node DYMO Network Simulation
//!
//! Runs several engines against each other without a real network. It
//! models:
//!
//! - An explicit, symmetric link set (chain, full mesh, or manual)
//! - Frames travelling through the wire codec with jitter plus a fixed hop delay
//! - Link failures and repairs scheduled at arbitrary times
//! - Per-node timers advanced in simulated time
//!
//! Events are processed in `(time, sequence)` order so runs are fully
//! reproducible for a given seed.
//!
//! ## Example
//!
//! ```
//! use dymo_core::simulation::{Network, SimConfig};
//! use dymo_core::time::Timestamp;
//!
//! let mut net = Network::chain(SimConfig::default().with_node_count(4)).unwrap();
//! net.send(0, 3, b"ping".to_vec()).unwrap();
//! net.run_until(Timestamp::from_secs(5)).unwrap();
//! assert_eq!(net.stats().messages_delivered, 1);
//! ```

use crate::address::{Address, InterfaceId};
use crate::config::DymoConfig;
use crate::engine::Engine;
use crate::error::{DymoError, Result};
use crate::stats::EngineStats;
use crate::time::Timestamp;
use crate::timer::ManualTimers;
use crate::traits::{Arrival, Outbox, Transmission};
use crate::wire;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::time::Duration;
use tracing::{debug, info, trace};

/// Engine type driven by the simulator
pub type SimNode = Engine<ManualTimers, Outbox>;

/// Simulation configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Number of nodes in the simulation
    pub node_count: usize,
    /// Propagation plus processing delay of one hop
    pub hop_delay: Duration,
    /// Random seed for reproducibility
    pub seed: u64,
    /// Protocol configuration shared by every node
    pub dymo: DymoConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            node_count: 5,
            hop_delay: Duration::from_millis(2),
            seed: 42,
            dymo: DymoConfig::default().with_address_base(Address::new(10, 0, 0, 0)),
        }
    }
}

impl SimConfig {
    pub fn with_node_count(mut self, count: usize) -> Self {
        self.node_count = count;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_hop_delay(mut self, delay: Duration) -> Self {
        self.hop_delay = delay;
        self
    }

    pub fn with_dymo(mut self, dymo: DymoConfig) -> Self {
        self.dymo = dymo;
        self
    }
}

/// Simulation statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimStats {
    /// Application packets handed to a source node
    pub messages_sent: u64,
    /// Application packets delivered at their destination
    pub messages_delivered: u64,
    /// Discovery failures reported to the upper layers
    pub unreachable_reports: u64,
    /// Sum of end-to-end delays of delivered packets (seconds)
    pub delivery_latency: f64,
    /// Frames put on a link, counted once per receiver
    pub frames_transmitted: u64,
    pub frames_received: u64,
    /// Frames addressed over a link that was down
    pub frames_lost: u64,
    /// Nominal bytes of control traffic sent
    pub control_bytes: u64,
    /// Engine counters summed over every node, filled by [`Network::finish`]
    pub engines: EngineStats,
}

impl SimStats {
    /// Message delivery rate (0.0 - 1.0)
    pub fn delivery_rate(&self) -> f64 {
        if self.messages_sent == 0 {
            0.0
        } else {
            self.messages_delivered as f64 / self.messages_sent as f64
        }
    }

    /// Average end-to-end delay in seconds
    pub fn mean_latency(&self) -> Option<f64> {
        (self.messages_delivered > 0).then(|| self.delivery_latency / self.messages_delivered as f64)
    }
}

/// Scheduled happenings of the simulation
#[derive(Debug, Clone)]
enum Event {
    /// A frame arrives at a node
    Deliver { to: usize, from: usize, frame: Vec<u8> },
    /// The upper layer of `from` sends a packet
    AppSend { from: usize, to: usize, payload: Vec<u8> },
    LinkDown { a: usize, b: usize },
    LinkUp { a: usize, b: usize },
}

#[derive(Debug, Clone)]
struct ScheduledEvent {
    time: Timestamp,
    seq: u64,
    event: Event,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the max-heap pops the earliest event first
        other.time.cmp(&self.time).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A set of DYMO nodes connected by simulated links
#[derive(Debug)]
pub struct Network {
    config: SimConfig,
    nodes: Vec<SimNode>,
    index: HashMap<Address, usize>,
    links: BTreeSet<(usize, usize)>,
    events: BinaryHeap<ScheduledEvent>,
    next_seq: u64,
    now: Timestamp,
    stats: SimStats,
}

impl Network {
    /// Create `config.node_count` unconnected nodes
    ///
    /// Node `i` gets the address `base + i + 1`.
    pub fn new(config: SimConfig) -> Result<Self> {
        let mut nodes = Vec::with_capacity(config.node_count);
        let mut index = HashMap::new();
        for i in 0..config.node_count {
            let address = config.dymo.node_address(i as u32 + 1);
            let mut dymo = config.dymo.clone();
            dymo.jitter_seed = config.seed;
            nodes.push(Engine::new(dymo, address, ManualTimers::new(), Outbox::new())?);
            index.insert(address, i);
        }
        info!("Created network of {} nodes", config.node_count);

        Ok(Self {
            config,
            nodes,
            index,
            links: BTreeSet::new(),
            events: BinaryHeap::new(),
            next_seq: 0,
            now: Timestamp::ZERO,
            stats: SimStats::default(),
        })
    }

    /// Nodes linked in a line: 0 - 1 - 2 - ...
    pub fn chain(config: SimConfig) -> Result<Self> {
        let mut net = Self::new(config)?;
        for i in 1..net.nodes.len() {
            net.link(i - 1, i)?;
        }
        Ok(net)
    }

    /// Every node linked to every other node
    pub fn full_mesh(config: SimConfig) -> Result<Self> {
        let mut net = Self::new(config)?;
        for a in 0..net.nodes.len() {
            for b in a + 1..net.nodes.len() {
                net.link(a, b)?;
            }
        }
        Ok(net)
    }

    /// Bring up the link between `a` and `b`
    pub fn link(&mut self, a: usize, b: usize) -> Result<()> {
        let key = self.link_key(a, b)?;
        self.links.insert(key);
        Ok(())
    }

    /// Take down the link between `a` and `b`
    pub fn unlink(&mut self, a: usize, b: usize) -> Result<()> {
        let key = self.link_key(a, b)?;
        self.links.remove(&key);
        Ok(())
    }

    pub fn is_linked(&self, a: usize, b: usize) -> bool {
        self.links.contains(&(a.min(b), a.max(b)))
    }

    /// Indices of nodes linked to `node`, ascending
    pub fn neighbours(&self, node: usize) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&other| other != node && self.is_linked(node, other))
            .collect()
    }

    /// Send application data from `from` to `to` now
    pub fn send(&mut self, from: usize, to: usize, payload: Vec<u8>) -> Result<()> {
        self.schedule_send(self.now, from, to, payload)
    }

    /// Send application data from `from` to `to` at `at`
    pub fn schedule_send(&mut self, at: Timestamp, from: usize, to: usize, payload: Vec<u8>) -> Result<()> {
        self.check_node(from)?;
        self.check_node(to)?;
        self.push(at, Event::AppSend { from, to, payload });
        Ok(())
    }

    /// Take the link between `a` and `b` down at `at`
    pub fn schedule_link_down(&mut self, at: Timestamp, a: usize, b: usize) -> Result<()> {
        self.link_key(a, b)?;
        self.push(at, Event::LinkDown { a, b });
        Ok(())
    }

    /// Bring the link between `a` and `b` up at `at`
    pub fn schedule_link_up(&mut self, at: Timestamp, a: usize, b: usize) -> Result<()> {
        self.link_key(a, b)?;
        self.push(at, Event::LinkUp { a, b });
        Ok(())
    }

    /// Process every event and timer due up to and including `until`
    pub fn run_until(&mut self, until: Timestamp) -> Result<()> {
        loop {
            let next_event = self.events.peek().map(|e| e.time);
            let next_timer = self.next_timer();

            let fire_timer = match (next_event, next_timer) {
                (None, None) => break,
                (Some(_), None) => false,
                (None, Some(_)) => true,
                (Some(event), Some((deadline, _))) => deadline < event,
            };

            if fire_timer {
                let Some((deadline, node)) = next_timer else {
                    break;
                };
                if deadline > until {
                    break;
                }
                self.advance_to(deadline);
                self.fire_timers(node)?;
            } else {
                let Some(time) = next_event else {
                    break;
                };
                if time > until {
                    break;
                }
                let Some(scheduled) = self.events.pop() else {
                    break;
                };
                self.advance_to(time);
                self.process(scheduled.event)?;
            }
        }
        self.advance_to(until);
        Ok(())
    }

    /// Run for `duration` of simulated time
    pub fn run_for(&mut self, duration: Duration) -> Result<()> {
        self.run_until(self.now + duration)
    }

    /// Shut every engine down and return the final statistics
    pub fn finish(&mut self) -> SimStats {
        let mut total = EngineStats::default();
        for node in &mut self.nodes {
            total.merge(&node.finish());
        }
        self.stats.engines = total;
        self.stats.clone()
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> Option<&SimNode> {
        self.nodes.get(index)
    }

    pub fn node_mut(&mut self, index: usize) -> Option<&mut SimNode> {
        self.nodes.get_mut(index)
    }

    /// Address of node `index`
    pub fn address(&self, index: usize) -> Option<Address> {
        self.nodes.get(index).map(|n| n.address())
    }

    /// Node index owning `address`
    pub fn index_of(&self, address: Address) -> Option<usize> {
        self.index.get(&address).copied()
    }

    fn check_node(&self, node: usize) -> Result<()> {
        if node < self.nodes.len() {
            Ok(())
        } else {
            Err(DymoError::Config(format!(
                "no node {} in a network of {}",
                node,
                self.nodes.len()
            )))
        }
    }

    fn link_key(&self, a: usize, b: usize) -> Result<(usize, usize)> {
        self.check_node(a)?;
        self.check_node(b)?;
        if a == b {
            return Err(DymoError::Config(format!("cannot link node {} to itself", a)));
        }
        Ok((a.min(b), a.max(b)))
    }

    fn push(&mut self, time: Timestamp, event: Event) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.push(ScheduledEvent { time, seq, event });
    }

    /// Earliest unannounced timer deadline and its node
    fn next_timer(&self) -> Option<(Timestamp, usize)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.timers().next_deadline().map(|at| (at, i)))
            .min()
    }

    fn advance_to(&mut self, time: Timestamp) {
        if time > self.now {
            self.now = time;
        }
        for node in &mut self.nodes {
            node.timers_mut().set_now(self.now);
        }
    }

    fn fire_timers(&mut self, index: usize) -> Result<()> {
        let node = &mut self.nodes[index];
        while node.timers_mut().pop_due().is_some() {
            node.handle_timer_fired();
        }
        // One wake-up can leave other expired timers behind; settle them
        let mut remaining = node.timers().expired_count();
        while remaining > 0 {
            node.handle_timer_fired();
            let after = node.timers().expired_count();
            if after >= remaining {
                break;
            }
            remaining = after;
        }
        self.collect(index)
    }

    fn process(&mut self, event: Event) -> Result<()> {
        match event {
            Event::AppSend { from, to, payload } => {
                let destination = self.nodes[to].address();
                trace!("Node {} sends {} bytes to {}", from, payload.len(), destination);
                self.stats.messages_sent += 1;
                self.nodes[from].send_data(destination, payload);
                self.collect(from)
            }
            Event::Deliver { to, from, frame } => {
                if !self.is_linked(from, to) {
                    debug!("Link {}-{} went down, frame lost", from, to);
                    self.stats.frames_lost += 1;
                    return Ok(());
                }
                self.stats.frames_received += 1;
                let arrival = Arrival::new(self.nodes[from].address(), InterfaceId(0));
                self.nodes[to].handle_frame(&frame, arrival)?;
                self.collect(to)
            }
            Event::LinkDown { a, b } => {
                info!("Link {}-{} down", a, b);
                self.unlink(a, b)
            }
            Event::LinkUp { a, b } => {
                info!("Link {}-{} up", a, b);
                self.link(a, b)
            }
        }
    }

    /// Pick up the side effects node `index` produced
    fn collect(&mut self, index: usize) -> Result<()> {
        let host = self.nodes[index].host_mut();
        let transmissions = host.drain_transmissions();
        let delivered = std::mem::take(&mut host.delivered);
        let unreachable = std::mem::take(&mut host.unreachable);
        host.statistics.clear();

        for packet in delivered {
            self.stats.messages_delivered += 1;
            self.stats.delivery_latency += self.now.saturating_since(packet.created_at).as_secs_f64();
        }
        self.stats.unreachable_reports += unreachable.len() as u64;

        for transmission in transmissions {
            self.dispatch(index, transmission)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, from: usize, transmission: Transmission) -> Result<()> {
        let frame = wire::encode(&transmission.message)?;
        if transmission.message.is_control() {
            self.stats.control_bytes += transmission.message.byte_len() as u64;
        }

        let receivers = match transmission.next_hop.address() {
            None => self.neighbours(from),
            Some(address) => match self.index_of(address) {
                Some(to) if self.is_linked(from, to) => vec![to],
                _ => {
                    debug!(
                        "Node {} has no link to {}, {} lost",
                        from,
                        address,
                        transmission.message.name()
                    );
                    self.stats.frames_lost += 1;
                    Vec::new()
                }
            },
        };

        let at = self.now + transmission.jitter + self.config.hop_delay;
        for to in receivers {
            self.stats.frames_transmitted += 1;
            self.push(
                at,
                Event::Deliver {
                    to,
                    from,
                    frame: frame.clone(),
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_ordering() {
        let early = ScheduledEvent {
            time: Timestamp::from_secs(5),
            seq: 2,
            event: Event::LinkUp { a: 0, b: 1 },
        };
        let late = ScheduledEvent {
            time: Timestamp::from_secs(10),
            seq: 1,
            event: Event::LinkUp { a: 0, b: 1 },
        };
        assert!(early > late);

        let first = ScheduledEvent {
            time: Timestamp::from_secs(10),
            seq: 1,
            event: Event::LinkUp { a: 0, b: 1 },
        };
        let second = ScheduledEvent {
            time: Timestamp::from_secs(10),
            seq: 2,
            event: Event::LinkUp { a: 0, b: 1 },
        };
        assert!(first > second);
    }

    #[test]
    fn test_topologies() {
        let chain = Network::chain(SimConfig::default().with_node_count(4)).unwrap();
        assert_eq!(chain.neighbours(0), vec![1]);
        assert_eq!(chain.neighbours(2), vec![1, 3]);
        assert_eq!(chain.address(0), Some(Address::new(10, 0, 0, 1)));
        assert_eq!(chain.index_of(Address::new(10, 0, 0, 4)), Some(3));

        let mesh = Network::full_mesh(SimConfig::default().with_node_count(4)).unwrap();
        assert_eq!(mesh.neighbours(0), vec![1, 2, 3]);
    }

    #[test]
    fn test_bad_node_index() {
        let mut net = Network::chain(SimConfig::default().with_node_count(2)).unwrap();
        assert!(net.link(0, 7).is_err());
        assert!(net.link(1, 1).is_err());
        assert!(net.send(0, 9, vec![]).is_err());
    }

    #[test]
    fn test_neighbours_exchange_data() {
        let mut net = Network::chain(SimConfig::default().with_node_count(2)).unwrap();
        net.send(0, 1, b"hi".to_vec()).unwrap();
        net.run_for(Duration::from_secs(1)).unwrap();

        let stats = net.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_delivered, 1);
        assert_eq!(stats.frames_lost, 0);
        assert!(stats.mean_latency().is_some());
    }
}
