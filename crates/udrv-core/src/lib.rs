//! UD rendezvous and heartbeat engine.
//!
//! Binds one RDMA device, brings up an unreliable-datagram queue pair,
//! trades addressing info with a single peer over a TCP side channel,
//! resolves the path to the peer and then exchanges one datagram per
//! period until the device goes away.
//!
//! # Architecture
//!
//! - [`resources`]: ordered allocation and reverse-order release of the
//!   device objects of one binding.
//! - [`qp`]: queue-pair bring-up to ready-to-send.
//! - [`path`]: the asynchronous path query and address-handle creation.
//! - [`scheduler`]: the periodic send / receive / repost loop.
//! - [`session`]: the single device binding and its state machine.
//! - [`engine`]: the event loop that drives a session from device
//!   notifications.

pub mod config;
pub mod engine;
pub mod error;
pub mod path;
pub mod qp;
pub mod resources;
pub mod scheduler;
pub mod session;
pub mod stats;

pub use config::EngineConfig;
pub use engine::{Engine, EngineEvent, EngineHandle, Interrupt};
pub use error::{ConfigError, EngineStopped, PathError, ResourceKind, SetupError};
pub use path::{PathResolver, ResolvedPath};
pub use session::{Session, SessionState, SessionStatus};
pub use stats::{SessionStats, StatsSnapshot};
