//! The interactive front end behind the `ask` binary.
//!
//! - [`config`]: argument parsing and layered configuration
//! - [`session`]: conversation history and turn handling
//! - [`commands`]: slash command parsing

mod commands;
mod config;
mod session;

pub use commands::{ChatCommand, help_text, parse_command};
pub use config::{ChatArgs, ChatConfig, ConfigFile, default_config_path};
pub use session::{ChatSession, SessionStats};
