#![forbid(unsafe_code)]

pub mod config;
pub mod session;
pub mod state;

#[cfg(test)]
mod state_tests;

pub use config::{MESSAGE_SYNC_INTERVAL, STATUS_PROBE_INTERVAL, SessionConfig};
pub use session::{ChatProviders, LiveChatClient};
pub use state::{ChatSnapshot, SharedState};
