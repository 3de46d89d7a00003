//! DYMO protocol engine
//!
//! The engine is a single-threaded, run-to-completion state machine. Each
//! call handles exactly one outbound packet, inbound message, or timer
//! wake-up and returns once every resulting side effect has been handed to
//! the [`Host`].
//!
//! ```text
//!  outbound data ──► route lookup ──► forward
//!                         │
//!                         └──► discovery (RREQ) + queue
//!
//!  RREQ/RREP ──► route updates ──► reply (target is self)
//!                     │
//!                     └──► relay / intermediate reply
//!
//!  RERR ──► invalidate routes via sender ──► forward RERR
//!
//!  timer ──► seq num loss ──► discovery retry ──► route aging
//! ```

use crate::address::{Address, InterfaceId, ADDRESS_BITS};
use crate::config::DymoConfig;
use crate::error::{DymoError, Result};
use crate::message::{AddressBlock, DataPacket, ErrorMessage, Message, RoutingKind, RoutingMessage};
use crate::outstanding::{ring_hop_limit, OutstandingRequest, OutstandingRequests};
use crate::quality::is_better;
use crate::queue::{PendingQueue, QueueElement};
use crate::rate_limit::TokenBucket;
use crate::routing::{RoutingEntry, RoutingTable};
use crate::seqnum::SeqNum;
use crate::stats::{
    EngineStats, STAT_DATA_DELAY, STAT_DATA_DELAY_PER_HOP, STAT_DATA_HOPS, STAT_DATA_SOURCE, STAT_DISCOVERY_DELAY,
};
use crate::timer::{Timer, TimerService};
use crate::traits::{Arrival, Host, NextHop};
use crate::wire;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Mutable protocol state of one node
#[derive(Debug)]
pub struct ProtocolState {
    pub own_address: Address,
    pub own_seq_num: SeqNum,
    /// While running, the node must not send control traffic
    pub seqnum_loss: Timer,
    pub seqnum_loss_max: Timer,
    pub table: RoutingTable,
    pub outstanding: OutstandingRequests,
    pub queue: PendingQueue,
    pub rreq_limiter: TokenBucket,
    pub stats: EngineStats,
}

/// Reactive routing engine for one node
#[derive(Debug)]
pub struct Engine<T: TimerService, H: Host> {
    config: DymoConfig,
    state: ProtocolState,
    timers: T,
    host: H,
    rng: StdRng,
}

impl<T: TimerService, H: Host> Engine<T, H> {
    /// Create an engine for the node at `address`
    pub fn new(config: DymoConfig, address: Address, timers: T, host: H) -> Result<Self> {
        config.validate()?;
        let now = timers.now();
        let rreq_limiter = TokenBucket::new(config.rreq_rate_limit, f64::from(config.rreq_burst_limit), now);
        let rng = StdRng::seed_from_u64(config.jitter_seed.wrapping_add(u64::from(address.to_u32())));
        debug!("DYMO engine for {} ready", address);
        Ok(Self {
            config,
            state: ProtocolState {
                own_address: address,
                own_seq_num: SeqNum::INITIAL,
                seqnum_loss: Timer::new(),
                seqnum_loss_max: Timer::new(),
                table: RoutingTable::new(),
                outstanding: OutstandingRequests::new(),
                queue: PendingQueue::new(),
                rreq_limiter,
                stats: EngineStats::default(),
            },
            timers,
            host,
            rng,
        })
    }

    pub fn config(&self) -> &DymoConfig {
        &self.config
    }

    pub fn address(&self) -> Address {
        self.state.own_address
    }

    pub fn seq_num(&self) -> SeqNum {
        self.state.own_seq_num
    }

    pub fn state(&self) -> &ProtocolState {
        &self.state
    }

    pub fn table(&self) -> &RoutingTable {
        &self.state.table
    }

    pub fn stats(&self) -> &EngineStats {
        &self.state.stats
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn timers(&self) -> &T {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut T {
        &mut self.timers
    }

    /// Packets waiting for a route
    pub fn queued(&self) -> usize {
        self.state.queue.len()
    }

    /// Discoveries in progress
    pub fn outstanding(&self) -> &OutstandingRequests {
        &self.state.outstanding
    }

    /// Change the own address
    ///
    /// Ignored once the node has originated any control message, since
    /// other nodes may already route to the old address.
    pub fn set_address(&mut self, address: Address) {
        if self.state.stats.has_participated() {
            info!(
                "Ignoring address change to {}: {} already participated in DYMO",
                address, self.state.own_address
            );
            return;
        }
        self.state.own_address = address;
    }

    /// Forget the own sequence number
    ///
    /// No control traffic is sent until the loss timeout elapses; on expiry
    /// the number restarts at 1.
    pub fn lose_sequence_number(&mut self) {
        let short = self.config.seqnum_loss_timeout();
        let long = self.config.seqnum_loss_max_timeout();
        self.state.seqnum_loss.start(&mut self.timers, short);
        self.state.seqnum_loss_max.start(&mut self.timers, long);
        info!("{} lost its sequence number", self.state.own_address);
    }

    /// Whether control traffic is currently suppressed
    pub fn seqnum_lost(&self) -> bool {
        self.state.seqnum_loss.is_running(&self.timers)
    }

    /// Send application data from this node
    pub fn send_data(&mut self, destination: Address, payload: Vec<u8>) {
        let packet = DataPacket::new(self.state.own_address, destination, self.timers.now(), payload);
        self.handle_outbound(packet);
    }

    /// Send application data to a symbolic destination
    pub fn handle_outbound_named(&mut self, name: &str, payload: Vec<u8>) -> Result<()> {
        let destination = self
            .host
            .resolve(name)
            .ok_or_else(|| DymoError::UnresolvedDestination(name.to_string()))?;
        self.send_data(destination, payload);
        Ok(())
    }

    /// Route a packet handed down by the upper layer
    pub fn handle_outbound(&mut self, packet: DataPacket) {
        let destination = packet.destination;

        if destination == self.state.own_address {
            trace!("Outbound packet for self, delivering locally");
            while let Some(element) = self.state.queue.dequeue_first_for(destination) {
                self.host.deliver_locally(element.packet);
            }
            self.host.deliver_locally(packet);
            return;
        }

        let mut target_seq = SeqNum::UNKNOWN;
        let mut target_dist = 0;
        if let Some(entry) = self.state.table.get_for_address(destination) {
            if entry.is_valid() {
                let (address, prefix) = (entry.address, entry.prefix);
                let next_hop = NextHop::unicast(entry.next_hop, entry.next_hop_interface);
                self.drain_queue(address, prefix, next_hop);
                self.state.stats.traffic_sent += 1;
                self.send(Message::Data(packet), next_hop);
                return;
            }
            target_seq = entry.seq_num;
            target_dist = entry.distance;
        }

        if self
            .state
            .outstanding
            .get_by_destination(destination, ADDRESS_BITS)
            .is_none()
        {
            debug!("No route to {}, starting discovery", destination);
            self.send_rreq(destination, self.config.min_hop_limit, target_seq, target_dist);
            let request = OutstandingRequest::start(destination, self.config.rreq_wait_time(), &mut self.timers);
            self.state.outstanding.add(request);
        } else {
            trace!("Discovery for {} already underway", destination);
        }

        self.state.queue.enqueue(QueueElement {
            seq_num_at_enqueue: self.state.own_seq_num,
            destination,
            source: self.state.own_address,
            packet,
        });
        trace!(
            "{} packets waiting for a route to {}",
            self.state.queue.count_for(destination),
            destination
        );
    }

    /// Decode a frame and dispatch it
    ///
    /// A frame with an unknown message kind is an unrecoverable protocol
    /// violation and is returned as an error.
    pub fn handle_frame(&mut self, bytes: &[u8], arrival: Arrival) -> Result<()> {
        let message = wire::decode(bytes)?;
        self.handle_inbound(message, arrival)
    }

    /// Dispatch a message received from a neighbour
    pub fn handle_inbound(&mut self, message: Message, arrival: Arrival) -> Result<()> {
        match message {
            Message::Request(rm) => self.handle_routing_message(RoutingKind::Request, rm, arrival),
            Message::Reply(rm) => self.handle_routing_message(RoutingKind::Reply, rm, arrival),
            Message::Error(rerr) => self.handle_error(rerr, arrival),
            Message::Unsupported(uerr) => {
                self.state.stats.control_received += 1;
                debug!(
                    "Received UERR from {} for kind {}, ignoring",
                    arrival.sender, uerr.unsupported_kind
                );
            }
            Message::Data(packet) => self.handle_inbound_data(packet),
        }
        Ok(())
    }

    /// Handle a data packet received from a neighbour
    pub fn handle_inbound_data(&mut self, packet: DataPacket) {
        let now = self.timers.now();
        let source = packet.source;
        let destination = packet.destination;

        if destination == self.state.own_address {
            let delay = now.saturating_since(packet.created_at).as_secs_f64();
            self.host.record_statistic(STAT_DATA_DELAY, delay);
            self.state.stats.data_latency += delay;
            self.state.stats.data_samples += 1;

            if let Some(entry) = self.state.table.get_for_address(source) {
                let hops = f64::from(entry.distance) + 1.0;
                self.host.record_statistic(STAT_DATA_HOPS, hops);
                self.host.record_statistic(STAT_DATA_DELAY_PER_HOP, delay / hops);
            }
            self.host.record_statistic(STAT_DATA_SOURCE, f64::from(source.to_u32()));
            self.state.stats.traffic_received += 1;
            self.host.deliver_locally(packet);
            return;
        }

        if destination.is_broadcast() || destination.is_multicast() {
            trace!("Passing through broadcast packet for {}", destination);
            return;
        }

        let mut target_seq = SeqNum::UNKNOWN;
        if let Some(entry) = self.state.table.get_for_address(destination) {
            if entry.is_valid() {
                self.update_route_lifetimes(destination);
                self.update_route_lifetimes(source);
                if let Some(next_hop) = self.valid_next_hop(destination) {
                    self.state.stats.traffic_forwarded += 1;
                    self.send(Message::Data(packet), next_hop);
                }
                return;
            }
            target_seq = entry.seq_num;
        }

        debug!("No route to forward packet for {}, sending RERR", destination);
        self.send_rerr(destination, target_seq);
    }

    /// Handle an RREQ or RREP
    fn handle_routing_message(&mut self, kind: RoutingKind, mut rm: RoutingMessage, arrival: Arrival) {
        self.state.stats.control_received += 1;
        let own = self.state.own_address;
        let is_request = kind == RoutingKind::Request;
        let next_hop = arrival.sender;
        let interface = arrival.interface;

        if rm.orig_node.address == own {
            trace!("Dropping own {:?} echoed back by {}", kind, arrival.sender);
            return;
        }

        if !self.update_route_from_block(&rm.orig_node, is_request, next_hop, interface) {
            debug!(
                "OrigNode {} carries no better information, dropping {:?}",
                rm.orig_node.address, kind
            );
            return;
        }

        let mut accepted = Vec::with_capacity(rm.additional_nodes.len());
        for block in std::mem::take(&mut rm.additional_nodes) {
            if block.address == own {
                debug!("{:?} already passed through {}, dropping", kind, own);
                return;
            }
            if self.update_route_from_block(&block, is_request, next_hop, interface) {
                accepted.push(block);
            } else {
                trace!("Stripping stale block for {}", block.address);
            }
        }
        rm.additional_nodes = accepted;

        if rm.target_node.address == own {
            self.handle_routing_message_for_me(kind, rm, NextHop::unicast(next_hop, interface));
        } else {
            self.relay_routing_message(kind, rm);
        }
    }

    fn handle_routing_message_for_me(&mut self, kind: RoutingKind, rm: RoutingMessage, previous_hop: NextHop) {
        match kind {
            RoutingKind::Request => {
                self.state.stats.rreq_received += 1;
                self.send_reply(rm.orig_node.address, rm.target_node.seq_num_or_unknown());
            }
            RoutingKind::Reply => {
                self.state.stats.rrep_received += 1;
                self.drain_queue(rm.orig_node.address, rm.orig_node.prefix_or_host(), previous_hop);
            }
        }
    }

    fn relay_routing_message(&mut self, kind: RoutingKind, mut rm: RoutingMessage) {
        let target = rm.target_node.address;
        let known = self.state.table.get_for_address(target).cloned();
        let target_seq = known.as_ref().map_or(SeqNum::UNKNOWN, |e| e.seq_num);
        let route = known.filter(RoutingEntry::is_valid);

        let route = match (kind, route) {
            (RoutingKind::Reply, None) => {
                debug!("No route towards RREP target {}, sending RERR", target);
                self.send_rerr(target, target_seq);
                return;
            }
            (RoutingKind::Request, Some(route))
                if rm
                    .target_node
                    .seq_num
                    .is_some_and(|seq| !seq.is_fresher_than(route.seq_num)) =>
            {
                debug!("Answering RREQ for {} as intermediate router", target);
                self.state.stats.rreq_received += 1;
                self.send_intermediate_replies(&rm.orig_node, &rm.target_node, &route);
                return;
            }
            (_, route) => route,
        };

        if rm.orig_node.dist_would_overflow() {
            debug!("Relaying would overflow OrigNode distance, dropping");
            return;
        }
        rm.orig_node.increment_dist();
        rm.additional_nodes.retain(|b| !b.dist_would_overflow());
        for block in rm.additional_nodes.iter_mut() {
            block.increment_dist();
        }

        self.state.own_seq_num.increment();
        rm.additional_nodes.push(self.own_block());
        rm.hop_limit = rm.hop_limit.saturating_sub(1);

        if rm.hop_limit < 1 {
            debug!("{:?} for {} reached its hop limit", kind, target);
            return;
        }
        if self.seqnum_lost() {
            debug!("Sequence number lost, not relaying {:?}", kind);
            return;
        }
        if kind == RoutingKind::Request && !self.consume_rreq_token() {
            debug!("RREQ rate limit exceeded, not relaying");
            return;
        }

        let next_hop = match route {
            Some(route) if kind == RoutingKind::Reply => NextHop::unicast(route.next_hop, route.next_hop_interface),
            _ => NextHop::AllRouters,
        };
        self.send(Message::routing(kind, rm), next_hop);
        match kind {
            RoutingKind::Request => self.state.stats.rreq_forwarded += 1,
            RoutingKind::Reply => self.state.stats.rrep_forwarded += 1,
        }
    }

    /// Handle a route error
    fn handle_error(&mut self, rerr: ErrorMessage, arrival: Arrival) {
        self.state.stats.control_received += 1;
        let delete_timeout = self.config.route_delete_timeout();
        let mut forward = Vec::new();

        debug!("Received RERR from {}", arrival.sender);
        for unreachable in &rerr.unreachable_nodes {
            if unreachable.address.is_multicast() {
                continue;
            }
            for entry in self.state.table.iter_mut() {
                if entry.broken || !entry.covers(unreachable.address) {
                    continue;
                }
                if entry.next_hop != arrival.sender || entry.next_hop_interface != arrival.interface {
                    continue;
                }
                let applies = entry.seq_num.is_unknown()
                    || unreachable
                        .seq_num
                        .map_or(true, |seq| !entry.seq_num.is_fresher_than(seq));
                if !applies {
                    continue;
                }

                info!("RERR invalidates route to {} via {}", entry.address, entry.next_hop);
                entry.broken = true;
                entry.delete.start(&mut self.timers, delete_timeout);

                let mut block = AddressBlock::new(unreachable.address);
                block.seq_num = unreachable.seq_num;
                if !entry.seq_num.is_unknown() {
                    block.seq_num = Some(entry.seq_num);
                }
                forward.push(block);
            }
        }

        if forward.is_empty() || self.seqnum_lost() || rerr.hop_limit <= 1 {
            self.state.stats.rerr_received += 1;
            return;
        }

        let message = Message::Error(ErrorMessage {
            hop_limit: rerr.hop_limit - 1,
            unreachable_nodes: forward,
        });
        self.send(message, NextHop::AllRouters);
        self.state.stats.rerr_forwarded += 1;
    }

    /// Handle a timer wake-up
    ///
    /// Checks sequence number loss, then one expired discovery, then the
    /// first routing entry with an expired aging timer. Each expired timer
    /// acted upon is consumed.
    pub fn handle_timer_fired(&mut self) {
        if self.state.seqnum_loss.is_expired(&self.timers) || self.state.seqnum_loss_max.is_expired(&self.timers) {
            self.state.seqnum_loss.cancel(&mut self.timers);
            self.state.seqnum_loss_max.cancel(&mut self.timers);
            self.state.own_seq_num = SeqNum::INITIAL;
            info!("{} restarts its sequence number", self.state.own_address);
        }

        if let Some(destination) = self.state.outstanding.first_expired(&self.timers) {
            self.handle_rreq_timeout(destination);
        }

        self.age_routes();
    }

    fn handle_rreq_timeout(&mut self, destination: Address) {
        let known = self.state.table.get_for_address(destination).cloned();

        if let Some(route) = known.as_ref().filter(|e| e.is_valid()) {
            trace!("RREQ for {} timed out but a route exists", destination);
            let next_hop = NextHop::unicast(route.next_hop, route.next_hop_interface);
            self.drain_queue(route.address, route.prefix, next_hop);
            return;
        }

        let max_tries = self.config.rreq_tries;
        let Some(request) = self.state.outstanding.get_mut(destination) else {
            return;
        };

        if request.tries < max_tries {
            request.retry(&mut self.timers);
            let tries = request.tries;
            let target_seq = match &known {
                Some(entry) if tries < max_tries => entry.seq_num,
                _ => SeqNum::UNKNOWN,
            };
            let target_dist = known.as_ref().map_or(0, |e| e.distance);
            let hop_limit = ring_hop_limit(self.config.min_hop_limit, self.config.max_hop_limit, tries, max_tries);
            debug!(
                "RREQ for {} timed out, attempt {} with hop limit {}",
                destination, tries, hop_limit
            );
            self.send_rreq(destination, hop_limit, target_seq, target_dist);
        } else {
            info!("Route discovery for {} failed after {} tries", destination, max_tries);
            self.host.destination_unreachable(destination);
            let dropped = self.state.queue.discard_all_for(destination);
            if dropped > 0 {
                debug!("Discarded {} packets queued for {}", dropped, destination);
            }
            self.state.outstanding.remove(destination, &mut self.timers);
        }
    }

    fn age_routes(&mut self) {
        let delete_timeout = self.config.route_delete_timeout();
        let timers = &mut self.timers;

        for index in 0..self.state.table.len() {
            let Some(entry) = self.state.table.get_mut(index) else {
                break;
            };

            if entry.age_min.is_expired(timers) {
                entry.age_min.cancel(timers);
                return;
            }
            if entry.age_max.is_expired(timers) {
                let mut removed = self.state.table.take(index);
                removed.cancel_timers(timers);
                info!("Route to {}/{} reached its maximum age", removed.address, removed.prefix);
                return;
            }
            if entry.new.is_expired(timers) {
                entry.new.cancel(timers);
                if !entry.used.is_running(timers) {
                    trace!("Route to {} no longer new and unused", entry.address);
                    entry.delete.start(timers, delete_timeout);
                }
                return;
            }
            if entry.used.is_expired(timers) {
                entry.used.cancel(timers);
                if !entry.new.is_running(timers) {
                    trace!("Route to {} no longer used", entry.address);
                    entry.delete.start(timers, delete_timeout);
                }
                return;
            }
            if entry.delete.is_expired(timers) {
                let mut removed = self.state.table.take(index);
                removed.cancel_timers(timers);
                info!("Deleting route to {}/{}", removed.address, removed.prefix);
                return;
            }
        }
    }

    /// Record final statistics and tear the engine state down
    pub fn finish(&mut self) -> EngineStats {
        for (name, value) in self.state.stats.scalars() {
            self.host.record_statistic(name, value);
        }

        for mut entry in self.state.table.drain() {
            entry.cancel_timers(&mut self.timers);
        }
        let dropped = self.state.queue.clear();
        if dropped > 0 {
            debug!("Discarding {} queued packets at shutdown", dropped);
        }
        self.state.outstanding.clear(&mut self.timers);
        self.state.seqnum_loss.cancel(&mut self.timers);
        self.state.seqnum_loss_max.cancel(&mut self.timers);

        self.state.stats.clone()
    }

    /// Apply one address block to the routing table
    ///
    /// Returns whether the block was better than what was stored.
    fn update_route_from_block(
        &mut self,
        block: &AddressBlock,
        is_request: bool,
        next_hop: Address,
        interface: InterfaceId,
    ) -> bool {
        let index = match self.state.table.position_for_address(block.address) {
            Some(index) => {
                let better = self
                    .state
                    .table
                    .get(index)
                    .is_some_and(|entry| is_better(entry, block, is_request));
                if !better {
                    return false;
                }
                debug!("Updating route to {}", block.address);
                index
            }
            None => {
                info!("Adding route to {} via {}", block.address, next_hop);
                self.state.table.add(RoutingEntry::new(block.address))
            }
        };

        let age_min = self.config.route_age_min_timeout();
        let age_max = self.config.route_age_max_timeout();
        let new = self.config.route_new_timeout();
        let Some(entry) = self.state.table.get_mut(index) else {
            return false;
        };
        entry.address = block.address;
        entry.seq_num = block.seq_num_or_unknown();
        entry.distance = block.dist.map_or(0, |d| u16::from(d) + 1);
        entry.next_hop = next_hop;
        entry.next_hop_interface = interface;
        entry.prefix = block.prefix_or_host();
        entry.broken = false;
        entry.age_min.start(&mut self.timers, age_min);
        entry.age_max.start(&mut self.timers, age_max);
        entry.new.start(&mut self.timers, new);
        entry.used.cancel(&mut self.timers);
        entry.delete.cancel(&mut self.timers);

        let (address, prefix) = (entry.address, entry.prefix);
        self.drain_queue(address, prefix, NextHop::unicast(next_hop, interface));
        true
    }

    /// Mark the route to `address` as in use and flush packets waiting on it
    fn update_route_lifetimes(&mut self, address: Address) {
        let used = self.config.route_used_timeout();
        let Some(entry) = self.state.table.get_for_address_mut(address) else {
            return;
        };
        if entry.broken {
            return;
        }
        entry.used.start(&mut self.timers, used);
        entry.delete.cancel(&mut self.timers);

        let (address, prefix) = (entry.address, entry.prefix);
        let next_hop = NextHop::unicast(entry.next_hop, entry.next_hop_interface);
        self.drain_queue(address, prefix, next_hop);
    }

    /// Send every packet queued for `address/prefix` and end its discovery
    fn drain_queue(&mut self, address: Address, prefix: u8, next_hop: NextHop) {
        let now = self.timers.now();
        while let Some(element) = self.state.queue.dequeue_first_matching(address, prefix) {
            let delay = now.saturating_since(element.packet.created_at).as_secs_f64();
            self.host.record_statistic(STAT_DISCOVERY_DELAY, delay);
            self.state.stats.discovery_latency += delay;
            self.state.stats.discovery_samples += 1;
            self.state.stats.traffic_sent += 1;
            trace!("Sending queued packet for {}", element.destination);
            self.send(Message::Data(element.packet), next_hop);
        }

        let done = self.state.outstanding.remove_matching(address, prefix, &mut self.timers);
        if done > 0 {
            trace!("Discovery for {}/{} complete", address, prefix);
        }
    }

    fn send_rreq(&mut self, destination: Address, hop_limit: u8, target_seq: SeqNum, target_dist: u16) {
        let mut target = AddressBlock::new(destination);
        if !target_seq.is_unknown() {
            target.seq_num = Some(target_seq);
        }
        if target_dist != 0 {
            target.dist = Some(clamp_dist(target_dist));
        }

        self.state.own_seq_num.increment();
        let rreq = RoutingMessage::new(hop_limit, self.own_block(), target);

        if self.seqnum_lost() {
            debug!("Sequence number lost, not sending RREQ for {}", destination);
            return;
        }
        if !self.consume_rreq_token() {
            debug!("RREQ rate limit exceeded, not sending RREQ for {}", destination);
            return;
        }

        debug!("Sending RREQ for {} with hop limit {}", destination, hop_limit);
        self.send(Message::Request(rreq), NextHop::AllRouters);
        self.state.stats.rreq_sent += 1;
    }

    /// Answer an RREQ that targets this node
    fn send_reply(&mut self, destination: Address, target_seq: SeqNum) {
        let Some(entry) = self.state.table.get_for_address(destination) else {
            warn!("Route to RREQ originator {} vanished, not replying", destination);
            return;
        };
        let target = AddressBlock::new(destination)
            .with_seq_num(entry.seq_num)
            .with_dist(clamp_dist(entry.distance));
        let next_hop = NextHop::unicast(entry.next_hop, entry.next_hop_interface);

        if target_seq.is_unknown() || self.state.own_seq_num.is_fresher_than(target_seq) {
            self.state.own_seq_num.increment();
        }
        let rrep = RoutingMessage::new(self.config.max_hop_limit, self.own_block(), target);

        if self.seqnum_lost() {
            debug!("Sequence number lost, not replying to {}", destination);
            return;
        }

        debug!("Sending RREP to {}", destination);
        self.send(Message::Reply(rrep), next_hop);
        self.state.stats.rrep_sent += 1;
    }

    /// Reply on behalf of the target, informing both ends of the path
    fn send_intermediate_replies(&mut self, orig: &AddressBlock, target: &AddressBlock, route_to_target: &RoutingEntry) {
        let Some(route_to_orig) = self.state.table.get_for_address(orig.address) else {
            warn!("Route to RREQ originator {} vanished, not replying", orig.address);
            return;
        };
        let orig_hop = NextHop::unicast(route_to_orig.next_hop, route_to_orig.next_hop_interface);
        let target_hop = NextHop::unicast(route_to_target.next_hop, route_to_target.next_hop_interface);

        self.state.own_seq_num.increment();
        let hop_limit = self.config.max_hop_limit;
        let orig_dist = orig.dist.map(|d| d.saturating_add(1));

        let mut to_orig = RoutingMessage::new(
            hop_limit,
            self.own_block(),
            AddressBlock {
                address: orig.address,
                seq_num: Some(orig.seq_num_or_unknown()),
                prefix: None,
                dist: orig_dist,
            },
        );
        let mut about_target = AddressBlock::new(route_to_target.address);
        if !route_to_target.seq_num.is_unknown() {
            about_target.seq_num = Some(route_to_target.seq_num);
        }
        if route_to_target.distance != 0 {
            about_target.dist = Some(clamp_dist(route_to_target.distance));
        }
        to_orig.additional_nodes.push(about_target);

        let mut to_target = RoutingMessage::new(
            hop_limit,
            self.own_block(),
            AddressBlock {
                address: target.address,
                seq_num: target.seq_num,
                prefix: None,
                dist: target.dist,
            },
        );
        to_target.additional_nodes.push(AddressBlock {
            address: orig.address,
            seq_num: Some(orig.seq_num_or_unknown()),
            prefix: None,
            dist: orig_dist,
        });

        if self.seqnum_lost() {
            debug!("Sequence number lost, not sending intermediate RREPs");
            return;
        }

        self.send(Message::Reply(to_orig), orig_hop);
        self.send(Message::Reply(to_target), target_hop);
        self.state.stats.rrep_sent += 2;
    }

    /// Report `destination` as unreachable to all neighbouring routers
    fn send_rerr(&mut self, destination: Address, seq_num: SeqNum) {
        let mut unreachable = vec![block_with_seq(destination, seq_num)];

        if let Some(broken) = self.state.table.get_for_address(destination).filter(|e| e.broken) {
            let (hop, interface) = (broken.next_hop, broken.next_hop_interface);
            let (broken_address, broken_prefix) = (broken.address, broken.prefix);
            for entry in self.state.table.iter() {
                if entry.next_hop != hop || entry.next_hop_interface != interface {
                    continue;
                }
                if entry.address == broken_address && entry.prefix == broken_prefix {
                    continue;
                }
                trace!("Including route to {} via {} in RERR", entry.address, entry.next_hop);
                unreachable.push(block_with_seq(entry.address, entry.seq_num));
            }
        }

        if self.seqnum_lost() {
            debug!("Sequence number lost, not sending RERR for {}", destination);
            return;
        }

        let rerr = ErrorMessage {
            hop_limit: self.config.max_hop_limit,
            unreachable_nodes: unreachable,
        };
        self.send(Message::Error(rerr), NextHop::AllRouters);
        self.state.stats.rerr_sent += 1;
    }

    fn valid_next_hop(&self, destination: Address) -> Option<NextHop> {
        self.state
            .table
            .get_for_address(destination)
            .filter(|e| e.is_valid())
            .map(|e| NextHop::unicast(e.next_hop, e.next_hop_interface))
    }

    /// Address block describing this node
    fn own_block(&self) -> AddressBlock {
        AddressBlock {
            address: self.state.own_address,
            seq_num: Some(self.state.own_seq_num),
            prefix: self.config.responsible_prefix,
            dist: Some(0),
        }
    }

    fn consume_rreq_token(&mut self) -> bool {
        let now = self.timers.now();
        self.state.rreq_limiter.consume(1.0, now)
    }

    fn jitter(&mut self) -> Duration {
        match self.config.max_jitter_us {
            0 => Duration::ZERO,
            max => Duration::from_micros(self.rng.gen_range(0..=max)),
        }
    }

    fn send(&mut self, message: Message, next_hop: NextHop) {
        let jitter = self.jitter();
        trace!(
            "{} sends {} ({} bytes) to {:?} after {:?}",
            self.state.own_address,
            message.name(),
            message.byte_len(),
            next_hop,
            jitter
        );
        self.host.transmit(message, next_hop, jitter);
    }
}

fn clamp_dist(distance: u16) -> u8 {
    u8::try_from(distance).unwrap_or(u8::MAX)
}

fn block_with_seq(address: Address, seq_num: SeqNum) -> AddressBlock {
    let block = AddressBlock::new(address);
    if seq_num.is_unknown() {
        block
    } else {
        block.with_seq_num(seq_num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualTimers;
    use crate::traits::Outbox;

    const IF0: InterfaceId = InterfaceId(0);

    fn addr(n: u8) -> Address {
        Address::new(10, 0, 0, n)
    }

    fn engine(n: u8, config: DymoConfig) -> Engine<ManualTimers, Outbox> {
        Engine::new(config, addr(n), ManualTimers::new(), Outbox::new()).unwrap()
    }

    fn rreq_from(orig: u8, seq: u16, target: u8, via: &[(u8, u16, u8)]) -> RoutingMessage {
        let mut rm = RoutingMessage::new(
            5,
            AddressBlock::new(addr(orig)).with_seq_num(SeqNum::new(seq)).with_dist(0),
            AddressBlock::new(addr(target)),
        );
        for &(a, s, d) in via {
            rm.additional_nodes
                .push(AddressBlock::new(addr(a)).with_seq_num(SeqNum::new(s)).with_dist(d));
        }
        rm
    }

    #[test]
    fn test_outbound_starts_discovery() {
        let mut node = engine(1, DymoConfig::default());
        node.send_data(addr(5), b"hello".to_vec());

        let rreqs = node.host().sent("RREQ");
        assert_eq!(rreqs.len(), 1);
        assert_eq!(rreqs[0].next_hop, NextHop::AllRouters);
        match &rreqs[0].message {
            Message::Request(rm) => {
                assert_eq!(rm.hop_limit, 5);
                assert_eq!(rm.target_node.address, addr(5));
                assert_eq!(rm.orig_node.dist, Some(0));
                assert_eq!(rm.orig_node.seq_num, Some(SeqNum::new(2)));
            }
            other => panic!("expected RREQ, got {:?}", other),
        }
        assert_eq!(node.queued(), 1);
        assert_eq!(node.outstanding().len(), 1);
        assert_eq!(node.outstanding().get_by_destination(addr(5), 32).unwrap().tries, 1);

        // A second packet joins the queue without another RREQ
        node.send_data(addr(5), b"again".to_vec());
        assert_eq!(node.host().sent("RREQ").len(), 1);
        assert_eq!(node.queued(), 2);
    }

    #[test]
    fn test_outbound_to_self_delivers() {
        let mut node = engine(1, DymoConfig::default());
        node.send_data(addr(1), vec![7]);
        assert_eq!(node.host().delivered.len(), 1);
        assert!(node.host().transmissions.is_empty());
    }

    #[test]
    fn test_request_for_me_is_answered() {
        let mut node = engine(3, DymoConfig::default());
        let rm = rreq_from(1, 10, 3, &[(2, 4, 0)]);
        node.handle_inbound(Message::Request(rm), Arrival::new(addr(2), IF0))
            .unwrap();

        assert_eq!(node.table().len(), 2);
        let to_orig = node.table().get_for_address(addr(1)).unwrap();
        assert_eq!(to_orig.next_hop, addr(2));
        assert_eq!(to_orig.distance, 1);

        let replies = node.host().sent("RREP");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].next_hop, NextHop::unicast(addr(2), IF0));
        match &replies[0].message {
            Message::Reply(rm) => {
                assert_eq!(rm.target_node.address, addr(1));
                assert_eq!(rm.target_node.seq_num, Some(SeqNum::new(10)));
                assert_eq!(rm.orig_node.address, addr(3));
                assert_eq!(rm.hop_limit, 10);
            }
            other => panic!("expected RREP, got {:?}", other),
        }
        assert_eq!(node.stats().rreq_received, 1);
    }

    #[test]
    fn test_relay_appends_own_block() {
        let mut node = engine(2, DymoConfig::default());
        let rm = rreq_from(1, 10, 5, &[]);
        node.handle_inbound(Message::Request(rm), Arrival::new(addr(1), IF0))
            .unwrap();

        let relayed = node.host().sent("RREQ");
        assert_eq!(relayed.len(), 1);
        match &relayed[0].message {
            Message::Request(rm) => {
                assert_eq!(rm.hop_limit, 4);
                assert_eq!(rm.orig_node.dist, Some(1));
                let own = rm.additional_nodes.last().unwrap();
                assert_eq!(own.address, addr(2));
                assert_eq!(own.dist, Some(0));
            }
            other => panic!("expected RREQ, got {:?}", other),
        }
        assert_eq!(node.stats().rreq_forwarded, 1);
    }

    #[test]
    fn test_message_through_self_is_dropped() {
        let mut node = engine(2, DymoConfig::default());
        let rm = rreq_from(1, 10, 5, &[(2, 3, 0)]);
        node.handle_inbound(Message::Request(rm), Arrival::new(addr(4), IF0))
            .unwrap();
        assert!(node.host().transmissions.is_empty());
    }

    #[test]
    fn test_duplicate_request_not_relayed_twice() {
        let mut node = engine(2, DymoConfig::default());
        let rm = rreq_from(1, 10, 5, &[]);
        node.handle_inbound(Message::Request(rm.clone()), Arrival::new(addr(1), IF0))
            .unwrap();
        node.handle_inbound(Message::Request(rm), Arrival::new(addr(1), IF0))
            .unwrap();
        assert_eq!(node.host().sent("RREQ").len(), 1);
    }

    #[test]
    fn test_reply_without_return_route_sends_rerr() {
        let mut node = engine(3, DymoConfig::default());
        let mut rm = rreq_from(5, 7, 1, &[]);
        rm.hop_limit = 10;
        node.handle_inbound(Message::Reply(rm), Arrival::new(addr(5), IF0)).unwrap();

        assert!(node.host().sent("RREP").is_empty());
        let errors = node.host().sent("RERR");
        assert_eq!(errors.len(), 1);
        match &errors[0].message {
            Message::Error(rerr) => assert_eq!(rerr.unreachable_nodes[0].address, addr(1)),
            other => panic!("expected RERR, got {:?}", other),
        }
    }

    #[test]
    fn test_intermediate_reply() {
        let mut node = engine(3, DymoConfig::default());
        // Learn a route to 5 with seq 20
        let rm = rreq_from(5, 20, 9, &[]);
        node.handle_inbound(Message::Request(rm), Arrival::new(addr(5), IF0))
            .unwrap();
        node.host_mut().drain_transmissions();

        let mut rm = rreq_from(1, 10, 5, &[]);
        rm.target_node = rm.target_node.with_seq_num(SeqNum::new(18));
        node.handle_inbound(Message::Request(rm), Arrival::new(addr(1), IF0))
            .unwrap();

        let replies = node.host().sent("RREP");
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].next_hop, NextHop::unicast(addr(1), IF0));
        assert_eq!(replies[1].next_hop, NextHop::unicast(addr(5), IF0));
        assert!(node.host().sent("RREQ").is_empty());
    }

    #[test]
    fn test_intermediate_reply_routes_via_replying_router() {
        let mut relay = engine(3, DymoConfig::default());
        // 5 sits two hops away, behind 4
        let mut rm = rreq_from(5, 20, 9, &[(4, 6, 0)]);
        rm.orig_node.dist = Some(1);
        relay.handle_inbound(Message::Request(rm), Arrival::new(addr(4), IF0))
            .unwrap();
        relay.host_mut().drain_transmissions();

        let mut rm = rreq_from(1, 10, 5, &[]);
        rm.target_node = rm.target_node.with_seq_num(SeqNum::new(18));
        relay.handle_inbound(Message::Request(rm), Arrival::new(addr(1), IF0))
            .unwrap();
        let to_orig = relay.host_mut().drain_transmissions().remove(0);
        assert_eq!(to_orig.next_hop, NextHop::unicast(addr(1), IF0));

        let mut source = engine(1, DymoConfig::default());
        source.send_data(addr(5), b"queued".to_vec());
        source.host_mut().drain_transmissions();
        source
            .handle_inbound(to_orig.message, Arrival::new(addr(3), IF0))
            .unwrap();

        let to_target = source.table().get_for_address(addr(5)).unwrap();
        assert_eq!(to_target.next_hop, addr(3));
        assert_eq!(to_target.distance, 3);
        let to_relay = source.table().get_for_address(addr(3)).unwrap();
        assert_eq!(to_relay.next_hop, addr(3));
        assert_eq!(to_relay.distance, 1);

        let data = source.host().sent("DATA");
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].next_hop, NextHop::unicast(addr(3), IF0));
        assert_eq!(source.queued(), 0);
    }

    #[test]
    fn test_relay_drops_overflowing_distances() {
        let mut node = engine(2, DymoConfig::default());
        let mut rm = rreq_from(1, 10, 5, &[]);
        rm.orig_node.dist = Some(0xFE);
        node.handle_inbound(Message::Request(rm), Arrival::new(addr(1), IF0))
            .unwrap();
        assert!(node.host().transmissions.is_empty());

        let rm = rreq_from(6, 4, 5, &[(7, 3, 0xFE), (8, 2, 0)]);
        node.handle_inbound(Message::Request(rm), Arrival::new(addr(8), IF0))
            .unwrap();
        let relayed = node.host().sent("RREQ");
        assert_eq!(relayed.len(), 1);
        match &relayed[0].message {
            Message::Request(rm) => {
                assert_eq!(rm.orig_node.dist, Some(1));
                let hops: Vec<_> = rm.additional_nodes.iter().map(|b| (b.address, b.dist)).collect();
                assert_eq!(hops, vec![(addr(8), Some(1)), (addr(2), Some(0))]);
            }
            other => panic!("expected RREQ, got {:?}", other),
        }
    }

    #[test]
    fn test_relay_strips_stale_blocks() {
        let mut node = engine(2, DymoConfig::default());
        node.handle_inbound(Message::Request(rreq_from(4, 9, 7, &[])), Arrival::new(addr(4), IF0))
            .unwrap();
        node.host_mut().drain_transmissions();

        // The block for 4 is older than what the table already holds
        let mut rm = rreq_from(1, 10, 5, &[(3, 2, 1), (4, 5, 0)]);
        rm.orig_node.dist = Some(2);
        node.handle_inbound(Message::Request(rm), Arrival::new(addr(4), IF0))
            .unwrap();

        let relayed = node.host().sent("RREQ");
        assert_eq!(relayed.len(), 1);
        match &relayed[0].message {
            Message::Request(rm) => {
                let hops: Vec<_> = rm.additional_nodes.iter().map(|b| b.address).collect();
                assert_eq!(hops, vec![addr(3), addr(2)]);
                assert_eq!(rm.orig_node.dist, Some(3));
            }
            other => panic!("expected RREQ, got {:?}", other),
        }
        assert_eq!(node.table().get_for_address(addr(4)).unwrap().seq_num, SeqNum::new(9));
        assert_eq!(node.table().get_for_address(addr(3)).unwrap().next_hop, addr(4));
    }

    #[test]
    fn test_rerr_marks_route_broken() {
        let mut node = engine(1, DymoConfig::default());
        let mut rm = rreq_from(5, 7, 1, &[(2, 3, 0)]);
        rm.orig_node.dist = Some(2);
        node.handle_inbound(Message::Reply(rm), Arrival::new(addr(2), IF0)).unwrap();
        assert!(node.table().get_for_address(addr(5)).unwrap().is_valid());

        let rerr = ErrorMessage {
            hop_limit: 10,
            unreachable_nodes: vec![AddressBlock::new(addr(5)).with_seq_num(SeqNum::new(7))],
        };
        node.handle_inbound(Message::Error(rerr), Arrival::new(addr(2), IF0))
            .unwrap();

        assert!(node.table().get_for_address(addr(5)).unwrap().broken);
        let forwarded = node.host().sent("RERR");
        assert_eq!(forwarded.len(), 1);
        match &forwarded[0].message {
            Message::Error(rerr) => assert_eq!(rerr.hop_limit, 9),
            other => panic!("expected RERR, got {:?}", other),
        }
    }

    #[test]
    fn test_rerr_from_other_neighbour_ignored() {
        let mut node = engine(1, DymoConfig::default());
        let rm = rreq_from(5, 7, 1, &[(2, 3, 0)]);
        node.handle_inbound(Message::Reply(rm), Arrival::new(addr(2), IF0)).unwrap();

        let rerr = ErrorMessage {
            hop_limit: 10,
            unreachable_nodes: vec![AddressBlock::new(addr(5))],
        };
        node.handle_inbound(Message::Error(rerr), Arrival::new(addr(4), IF0))
            .unwrap();
        assert!(node.table().get_for_address(addr(5)).unwrap().is_valid());
        assert_eq!(node.stats().rerr_received, 1);
    }

    #[test]
    fn test_seqnum_loss_suppresses_and_resets() {
        let mut node = engine(1, DymoConfig::default());
        node.lose_sequence_number();
        node.send_data(addr(5), vec![1]);
        assert!(node.host().sent("RREQ").is_empty());
        // Queued and tracked even though nothing went out
        assert_eq!(node.queued(), 1);

        node.timers_mut().advance(Duration::from_secs(10));
        node.handle_timer_fired();
        assert!(!node.seqnum_lost());

        // The overdue discovery retries with the restarted sequence number
        let rreqs = node.host().sent("RREQ");
        assert_eq!(rreqs.len(), 1);
        match &rreqs[0].message {
            Message::Request(rm) => assert_eq!(rm.orig_node.seq_num, Some(SeqNum::new(2))),
            other => panic!("expected RREQ, got {:?}", other),
        }
    }

    #[test]
    fn test_set_address_after_participation_ignored() {
        let mut node = engine(1, DymoConfig::default());
        node.set_address(addr(9));
        assert_eq!(node.address(), addr(9));

        node.send_data(addr(5), vec![1]);
        node.set_address(addr(7));
        assert_eq!(node.address(), addr(9));
    }

    #[test]
    fn test_named_destination() {
        let host = Outbox::new().with_name("host[5]", addr(5));
        let mut node = Engine::new(DymoConfig::default(), addr(1), ManualTimers::new(), host).unwrap();
        node.handle_outbound_named("host[5]", vec![1]).unwrap();
        assert_eq!(node.host().sent("RREQ").len(), 1);

        match node.handle_outbound_named("host[9]", vec![1]) {
            Err(DymoError::UnresolvedDestination(name)) => assert_eq!(name, "host[9]"),
            other => panic!("expected UnresolvedDestination, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_frame_kind_is_fatal() {
        let mut node = engine(1, DymoConfig::default());
        let result = node.handle_frame(&[0x42, 0], Arrival::new(addr(2), IF0));
        assert!(matches!(result, Err(DymoError::UnknownMessageKind(0x42))));
    }

    #[test]
    fn test_finish_tears_down() {
        let mut node = engine(3, DymoConfig::default());
        let rm = rreq_from(1, 10, 3, &[]);
        node.handle_inbound(Message::Request(rm), Arrival::new(addr(1), IF0))
            .unwrap();
        node.send_data(addr(8), vec![1]);

        let stats = node.finish();
        assert_eq!(stats.rrep_sent, 1);
        assert!(node.table().is_empty());
        assert_eq!(node.queued(), 0);
        assert!(node.outstanding().is_empty());
        assert_eq!(node.timers().pending(), 0);
        assert_eq!(node.host().samples("DYMO_RREPSent"), vec![1.0]);
    }

    #[test]
    fn test_jitter_is_bounded_and_seeded() {
        let config = DymoConfig::default().with_jitter(Duration::from_micros(500), 42);
        let mut a = engine(1, config.clone());
        let mut b = engine(1, config);
        for n in 2..6 {
            a.send_data(addr(n), vec![]);
            b.send_data(addr(n), vec![]);
        }
        let ja: Vec<_> = a.host().transmissions.iter().map(|t| t.jitter).collect();
        let jb: Vec<_> = b.host().transmissions.iter().map(|t| t.jitter).collect();
        assert_eq!(ja, jb);
        assert!(ja.iter().all(|j| *j <= Duration::from_micros(500)));
    }
}
