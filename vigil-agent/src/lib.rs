use std::path::PathBuf;

pub mod agent;
pub mod commands;
pub mod config;
pub mod errors;
pub mod persistence;
pub mod sampler;
pub mod security;
pub mod server;
pub mod token_store;
pub mod watcher;

pub use agent::Agent;

const GLOBAL_STATE_DIR: &str = ".vigil";

/// `~/.vigil`, or `./.vigil` when the home directory is unknown
pub fn global_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(GLOBAL_STATE_DIR)
}
