//! Verbs device interface for the UD rendezvous engine.
//!
//! This crate describes the small slice of an RDMA verbs provider that the
//! engine needs: protection domains, memory regions, completion queues,
//! unreliable-datagram queue pairs, address handles, DMA mapping of host
//! buffers and asynchronous subnet-administration path queries.
//!
//! Hardware providers implement [`VerbsDevice`]. The [`sim`] module provides
//! an in-process fabric implementing the same trait, which lets the engine be
//! exercised end to end without RDMA hardware.
//!
//! # Architecture
//!
//! - [`VerbsDevice`]: the collaborator trait (device/port queries, resource
//!   allocation, queue-pair transitions, posting and polling).
//! - [`VerbsEvent`]: asynchronous completions delivered through an
//!   [`EventSink`] instead of callbacks.
//! - [`DmaBuf`]: a host buffer shared with the device for DMA.
//! - [`sim::SimFabric`] / [`sim::SimDevice`]: the simulated provider.

pub mod buf;
pub mod device;
pub mod error;
pub mod event;
pub mod sim;
pub mod types;

pub use buf::DmaBuf;
pub use device::{DeviceAttr, LinkLayer, PortAttr, PortState, VerbsDevice};
pub use error::VerbsError;
pub use event::{EventSink, QpEventKind, VerbsEvent};
pub use types::*;
