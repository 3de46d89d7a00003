//! Protocol configuration
//!
//! All timeouts are stored in milliseconds so configuration files stay
//! plain JSON numbers; the engine reads them through the `Duration`
//! accessors.

use crate::address::{Address, InterfaceId, ADDRESS_BITS};
use crate::error::{DymoError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// DYMO engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DymoConfig {
    /// Base added to the node index to form its address
    pub autoassign_address_base: Address,
    /// Prefix advertised for the own address; `None` routes the host only
    pub responsible_prefix: Option<u8>,
    /// Participating interfaces, indexed by [`InterfaceId`]
    pub interfaces: Vec<String>,

    pub route_age_min_timeout_ms: u64,
    pub route_age_max_timeout_ms: u64,
    pub route_new_timeout_ms: u64,
    pub route_used_timeout_ms: u64,
    pub route_delete_timeout_ms: u64,

    /// Hop limit of the first discovery attempt
    pub min_hop_limit: u8,
    /// Hop limit of the last discovery attempt and all other control messages
    pub max_hop_limit: u8,

    /// Discovery messages per second
    pub rreq_rate_limit: f64,
    /// Discovery burst size
    pub rreq_burst_limit: u32,
    /// Wait before the first discovery retry
    pub rreq_wait_time_ms: u64,
    /// Discovery attempts before giving up
    pub rreq_tries: u32,

    pub seqnum_loss_timeout_ms: u64,
    pub seqnum_loss_max_timeout_ms: u64,

    /// Upper bound of the random delay added to every transmission
    pub max_jitter_us: u64,
    /// Seed of the jitter random source
    pub jitter_seed: u64,
}

impl Default for DymoConfig {
    fn default() -> Self {
        Self {
            autoassign_address_base: Address::UNSPECIFIED,
            responsible_prefix: None,
            interfaces: vec!["wlan0".to_string()],
            route_age_min_timeout_ms: 1_000,
            route_age_max_timeout_ms: 60_000,
            route_new_timeout_ms: 5_000,
            route_used_timeout_ms: 5_000,
            route_delete_timeout_ms: 10_000,
            min_hop_limit: 5,
            max_hop_limit: 10,
            rreq_rate_limit: 10.0,
            rreq_burst_limit: 3,
            rreq_wait_time_ms: 1_000,
            rreq_tries: 3,
            seqnum_loss_timeout_ms: 10_000,
            seqnum_loss_max_timeout_ms: 60_000,
            max_jitter_us: 1_000,
            jitter_seed: 0,
        }
    }
}

impl DymoConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: DymoConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject combinations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.interfaces.is_empty() {
            return Err(DymoError::Config("at least one interface is required".into()));
        }
        if self.interfaces.len() > usize::from(u8::MAX) + 1 {
            return Err(DymoError::Config(format!("too many interfaces: {}", self.interfaces.len())));
        }
        if self.min_hop_limit == 0 {
            return Err(DymoError::Config("min_hop_limit must be at least 1".into()));
        }
        if self.min_hop_limit > self.max_hop_limit {
            return Err(DymoError::Config(format!(
                "min_hop_limit {} exceeds max_hop_limit {}",
                self.min_hop_limit, self.max_hop_limit
            )));
        }
        if self.rreq_tries == 0 {
            return Err(DymoError::Config("rreq_tries must be at least 1".into()));
        }
        if self.rreq_burst_limit == 0 {
            return Err(DymoError::Config("rreq_burst_limit must be at least 1".into()));
        }
        if self.rreq_rate_limit.is_nan() || self.rreq_rate_limit < 0.0 {
            return Err(DymoError::Config(format!("invalid rreq_rate_limit {}", self.rreq_rate_limit)));
        }
        if let Some(prefix) = self.responsible_prefix {
            if prefix > ADDRESS_BITS {
                return Err(DymoError::Config(format!("responsible_prefix {} exceeds {}", prefix, ADDRESS_BITS)));
            }
        }
        Ok(())
    }

    /// Address of the node with the given index
    pub fn node_address(&self, index: u32) -> Address {
        Address::from_u32(self.autoassign_address_base.to_u32().wrapping_add(index))
    }

    /// Id of the named interface
    pub fn interface_id(&self, name: &str) -> Option<InterfaceId> {
        self.interfaces
            .iter()
            .position(|i| i == name)
            .and_then(|i| u8::try_from(i).ok())
            .map(InterfaceId)
    }

    /// Builder: set both hop limits
    pub fn with_hop_limits(mut self, min: u8, max: u8) -> Self {
        self.min_hop_limit = min;
        self.max_hop_limit = max;
        self
    }

    /// Builder: set discovery attempts
    pub fn with_rreq_tries(mut self, tries: u32) -> Self {
        self.rreq_tries = tries;
        self
    }

    /// Builder: set the first discovery wait
    pub fn with_rreq_wait_time(mut self, wait: Duration) -> Self {
        self.rreq_wait_time_ms = duration_ms(wait);
        self
    }

    /// Builder: set discovery rate and burst limits
    pub fn with_rate_limit(mut self, per_sec: f64, burst: u32) -> Self {
        self.rreq_rate_limit = per_sec;
        self.rreq_burst_limit = burst;
        self
    }

    /// Builder: set the new/used/delete route timeouts
    pub fn with_route_timeouts(mut self, new: Duration, used: Duration, delete: Duration) -> Self {
        self.route_new_timeout_ms = duration_ms(new);
        self.route_used_timeout_ms = duration_ms(used);
        self.route_delete_timeout_ms = duration_ms(delete);
        self
    }

    /// Builder: set the min/max route age
    pub fn with_route_age(mut self, min: Duration, max: Duration) -> Self {
        self.route_age_min_timeout_ms = duration_ms(min);
        self.route_age_max_timeout_ms = duration_ms(max);
        self
    }

    /// Builder: set the responsible prefix
    pub fn with_responsible_prefix(mut self, prefix: Option<u8>) -> Self {
        self.responsible_prefix = prefix;
        self
    }

    /// Builder: set the address base
    pub fn with_address_base(mut self, base: Address) -> Self {
        self.autoassign_address_base = base;
        self
    }

    /// Builder: set jitter bound and seed
    pub fn with_jitter(mut self, max: Duration, seed: u64) -> Self {
        self.max_jitter_us = u64::try_from(max.as_micros()).unwrap_or(u64::MAX);
        self.jitter_seed = seed;
        self
    }

    pub fn route_age_min_timeout(&self) -> Duration {
        Duration::from_millis(self.route_age_min_timeout_ms)
    }

    pub fn route_age_max_timeout(&self) -> Duration {
        Duration::from_millis(self.route_age_max_timeout_ms)
    }

    pub fn route_new_timeout(&self) -> Duration {
        Duration::from_millis(self.route_new_timeout_ms)
    }

    pub fn route_used_timeout(&self) -> Duration {
        Duration::from_millis(self.route_used_timeout_ms)
    }

    pub fn route_delete_timeout(&self) -> Duration {
        Duration::from_millis(self.route_delete_timeout_ms)
    }

    pub fn rreq_wait_time(&self) -> Duration {
        Duration::from_millis(self.rreq_wait_time_ms)
    }

    pub fn seqnum_loss_timeout(&self) -> Duration {
        Duration::from_millis(self.seqnum_loss_timeout_ms)
    }

    pub fn seqnum_loss_max_timeout(&self) -> Duration {
        Duration::from_millis(self.seqnum_loss_max_timeout_ms)
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_micros(self.max_jitter_us)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
