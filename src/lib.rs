//! Core transport for reliable-connected RDMA.
//!
//! This crate provides the parts of a user-space RDMA transport that are
//! hard to get right and awkward to leave out of a reusable library: a
//! connection-manager (CM) driven state machine, completion queues shared
//! across many connections on one I/O context, a lock-free pool of
//! pre-registered DMA buffers, and remote-key remapping for migrating a
//! connection across host channel adapters (HCAs).
//!
//! Framing, retransmission, credit-based flow control and the per-context
//! event loop itself are intentionally not provided here; see
//! [`context::IoContext`] for the boundary this crate expects its host to
//! fill in.

#[macro_use]
mod util;

pub mod bindings;
pub mod cm;
pub mod consts;
pub mod context;
pub mod cq;
pub mod device;
pub mod error;
pub mod mr;
pub mod options;
pub mod pool;
pub mod slab;

mod conn;

pub use conn::{Connection, Env, ErrorCode, QpIndex, Sge, State, UpcallEvent, UpcallObserver};
pub use error::{Error, Result};
