//! minikv - an in-memory key-value store with per-key expiry
//!
//! This library provides:
//! - An expiring store with lazy and background expiry
//! - JSON snapshot persistence (dump/restore) with TTL rebasing
//! - A line-based text protocol over TCP
//! - Per-session or shared store topologies

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
mod snapshot;
pub mod store;
mod sweeper;
pub mod value;

pub use client::Client;
pub use config::{ServerConfig, StoreConfig, StoreTopology};
pub use error::{MiniKvError, Result};
pub use protocol::{Command, Response};
pub use server::MiniKvServer;
pub use store::{ExpiringStore, Store};
pub use value::Value;
