pub mod barge_in;
pub mod client;
pub mod config;
pub mod errors;
pub mod latency;
pub mod mode;
pub mod pipeline;
pub mod protocol;
pub mod providers;
pub mod session;

// Re-export commonly used items for convenience
pub use config::ServerConfig;
pub use errors::{GatewayError, GatewayResult};
pub use protocol::{AppState, ws_handler};
pub use session::{SessionManager, SessionMode, SessionStatus};
