pub mod config;
pub mod core;
pub mod transcript;

// Re-export commonly used items for convenience
pub use config::{AppConfig, ConfigError};
pub use core::*;
pub use transcript::{TranscriptRelay, TranscriptUpdate};
