//! Protocol module for coordinator communication
//!
//! Socket.IO framing over WebSocket, plus the named events of the
//! welcome → register → registered → work handshake.

mod engine;
mod messages;

pub use engine::*;
pub use messages::*;
