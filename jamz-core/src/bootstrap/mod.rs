//! Startup helpers shared by the server binary

mod config;

pub use config::{load_config, load_config_from, log_summary};
