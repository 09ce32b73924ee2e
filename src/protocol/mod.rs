//! Wire protocol: message types and the WebSocket connection layer.

pub mod gateway;
pub mod messages;

pub use gateway::{AppState, ws_handler};
pub use messages::{ClientMessage, MessageRoute, ServerMessage};
