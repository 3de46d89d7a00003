//! In-flight route discoveries
//!
//! One [`OutstandingRequest`] exists per destination while the engine is
//! searching for it. Each retry doubles the wait and widens the search
//! ring from the minimum towards the maximum hop limit.

use crate::address::Address;
use crate::time::Timestamp;
use crate::timer::{Timer, TimerService};
use std::time::Duration;

/// Wait interval for the next attempt
pub fn backoff(interval: Duration) -> Duration {
    interval.saturating_mul(2)
}

/// Hop limit of attempt number `tries` (1-based) in an expanding ring search
///
/// Interpolates linearly from `min` on the first attempt to `max` on attempt
/// `max_tries`.
pub fn ring_hop_limit(min: u8, max: u8, tries: u32, max_tries: u32) -> u8 {
    if max_tries <= 1 || max <= min {
        return min;
    }
    let step = tries.saturating_sub(1).min(max_tries - 1);
    let span = u32::from(max - min);
    min + (span * step / (max_tries - 1)) as u8
}

/// One in-flight discovery
#[derive(Debug, Clone)]
pub struct OutstandingRequest {
    pub destination: Address,
    /// Attempts made so far, starting at 1
    pub tries: u32,
    pub wait_timer: Timer,
    pub created_at: Timestamp,
}

impl OutstandingRequest {
    /// Register the first attempt and arm its wait timer
    pub fn start<T: TimerService>(destination: Address, wait: Duration, timers: &mut T) -> Self {
        let mut wait_timer = Timer::new();
        wait_timer.start(timers, wait);
        Self {
            destination,
            tries: 1,
            wait_timer,
            created_at: timers.now(),
        }
    }

    /// Count another attempt and re-arm with a doubled wait
    pub fn retry<T: TimerService>(&mut self, timers: &mut T) {
        self.tries += 1;
        let next = backoff(self.wait_timer.interval());
        self.wait_timer.start(timers, next);
    }
}

/// All discoveries currently in progress
#[derive(Debug, Default)]
pub struct OutstandingRequests {
    requests: Vec<OutstandingRequest>,
}

impl OutstandingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, request: OutstandingRequest) {
        self.requests.push(request);
    }

    /// First request whose destination lies in `address/prefix`
    pub fn get_by_destination(&self, address: Address, prefix: u8) -> Option<&OutstandingRequest> {
        self.requests
            .iter()
            .find(|r| r.destination.prefix_matches(address, prefix))
    }

    /// Destination of the first request whose wait timer has expired
    pub fn first_expired<T: TimerService>(&self, timers: &T) -> Option<Address> {
        self.requests
            .iter()
            .find(|r| r.wait_timer.is_expired(timers))
            .map(|r| r.destination)
    }

    pub fn get_mut(&mut self, destination: Address) -> Option<&mut OutstandingRequest> {
        self.requests.iter_mut().find(|r| r.destination == destination)
    }

    /// Remove the request for exactly `destination`, disarming its timer
    pub fn remove<T: TimerService>(&mut self, destination: Address, timers: &mut T) -> Option<OutstandingRequest> {
        let idx = self.requests.iter().position(|r| r.destination == destination)?;
        let mut request = self.requests.remove(idx);
        request.wait_timer.cancel(timers);
        Some(request)
    }

    /// Remove every request whose destination lies in `address/prefix`
    pub fn remove_matching<T: TimerService>(&mut self, address: Address, prefix: u8, timers: &mut T) -> usize {
        let before = self.requests.len();
        self.requests.retain_mut(|r| {
            if r.destination.prefix_matches(address, prefix) {
                r.wait_timer.cancel(timers);
                false
            } else {
                true
            }
        });
        before - self.requests.len()
    }

    /// Drop all requests, disarming their timers
    pub fn clear<T: TimerService>(&mut self, timers: &mut T) {
        for mut request in self.requests.drain(..) {
            request.wait_timer.cancel(timers);
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
