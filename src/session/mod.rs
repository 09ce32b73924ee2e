//! Session lifecycle: records, registry and the per-session driver task.

pub mod manager;
pub mod runner;
pub mod types;

pub use manager::{SessionHandle, SessionManager, SessionRequest};
pub use runner::SessionCommand;
pub use types::{Session, SessionMode, SessionProviderConfig, SessionStatus, SessionSummary, Turn};
