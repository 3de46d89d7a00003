//! # DYMO Routing Engine
//!
//! This crate implements the Dynamic MANET On-demand (DYMO) reactive routing
//! protocol for multi-hop ad-hoc networks. Routes are only discovered when
//! traffic needs them.
//!
//! ## Overview
//!
//! - **Route discovery**: RREQ flooding with an expanding ring search,
//!   answered by a unicast RREP from the target or an intermediate router
//! - **Path accumulation**: every relay appends itself to routing messages,
//!   so one discovery teaches routes to every node on the path
//! - **Route maintenance**: RERR messages invalidate routes through a broken
//!   next hop; timers age out stale and unused routes
//! - **Sequence numbers**: 16-bit wrapping counters order routing
//!   information and prevent loops
//!
//! The engine is a synchronous, single-threaded state machine. Time and
//! transmission are injected through [`TimerService`] and [`Host`], which
//! makes it equally usable in the bundled [`simulation`] and on a real
//! network stack.
//!
//! ## Message Flow
//!
//! ```text
//! Source            Relay             Target
//!   │── RREQ ──────────►│── RREQ ──────────►│
//!   │                   │                   │
//!   │◄────────── RREP ──│◄────────── RREP ──│
//!   │                   │                   │
//!   │── DATA ──────────►│── DATA ──────────►│
//! ```
//!
//! ## Example
//!
//! ```rust
//! use dymo_core::{Address, DymoConfig, Engine, ManualTimers, Outbox};
//!
//! let mut node = Engine::new(
//!     DymoConfig::default(),
//!     Address::new(10, 0, 0, 1),
//!     ManualTimers::new(),
//!     Outbox::new(),
//! )
//! .unwrap();
//!
//! // No route yet: the packet is queued and an RREQ goes out
//! node.send_data(Address::new(10, 0, 0, 5), b"hello".to_vec());
//! assert_eq!(node.queued(), 1);
//! assert_eq!(node.host().sent("RREQ").len(), 1);
//! ```

pub mod address;
pub mod config;
pub mod engine;
pub mod error;
pub mod message;
pub mod outstanding;
pub mod quality;
pub mod queue;
pub mod rate_limit;
pub mod routing;
pub mod seqnum;
pub mod simulation;
pub mod stats;
pub mod time;
pub mod timer;
pub mod traits;
pub mod wire;

pub use address::{Address, InterfaceId};
pub use config::DymoConfig;
pub use engine::Engine;
pub use error::{DymoError, Result};
pub use message::{AddressBlock, DataPacket, ErrorMessage, Message, RoutingKind, RoutingMessage};
pub use routing::{RoutingEntry, RoutingTable};
pub use seqnum::SeqNum;
pub use simulation::{Network, SimConfig, SimStats};
pub use stats::EngineStats;
pub use time::Timestamp;
pub use timer::{ManualTimers, Timer, TimerService};
pub use traits::{Arrival, Host, NextHop, Outbox};
