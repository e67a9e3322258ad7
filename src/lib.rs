//! Connection-plane library for TCP servers that hold tens of thousands of
//! persistent connections on a fixed pool of worker threads.
//!
//! The pieces: an edge-triggered, one-shot epoll multiplexer with a
//! daisy-chained shutdown protocol, a pre-allocated slab of connection slots
//! recycled through a lock-free free list, a per-connection state machine
//! that turns readiness events into user callbacks, and a reaper that
//! expires idle connections. Protocol framing, statistics, and configuration
//! loading live above this crate.

pub mod client_pool;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod poller;
pub mod reaper;
pub mod server;
pub mod server_pool;
pub mod slab;

pub use client_pool::ClientPool;
pub use config::Config;
pub use error::Error;
pub use handler::{Callbacks, Session};
pub use server::Server;
pub use server_pool::ServerPool;
