//! Relay dispatcher
//!
//! Performs the outbound call for each work request and produces its
//! completion result.

mod dispatcher;
mod target;
mod tracker;

pub use dispatcher::*;
pub use target::*;
pub use tracker::*;
