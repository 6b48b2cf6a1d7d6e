//! Chat-reaction bot for live streams.
//!
//! Watches a channel's chat and reacts according to a YAML rule file:
//! greets users the first time they speak, answers `!` commands, polices
//! forbidden phrases, fires pattern triggers, runs viewer timers and
//! periodic announcements, and pushes audio and image events to OBS
//! overlay pages over WebSocket.

pub mod bot;
pub mod config;
pub mod overlay;
pub mod platforms;
pub mod storage;
pub mod types;

pub use bot::ChatBot;
pub use config::{BotConfig, ConfigManager};
pub use types::ChatMessage;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
