//! Type definitions for the Hydra agent
//!
//! Identity values presented at registration and the work request/result
//! pair that flows through the relay.

mod identity;
mod work;

pub use identity::*;
pub use work::*;
