//! Coordinator communication module
//!
//! Owns the Socket.IO channel to the coordinator, including:
//! - Connection establishment with auto-reconnect
//! - The welcome/registration handshake
//! - Delivery of work requests and completion events

mod client;

pub use client::*;
