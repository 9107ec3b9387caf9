pub mod commands;
pub mod config;

pub use commands::{run, Command, CommandContext};
pub use config::{cli_settings_path, load_cli_settings, save_cli_settings, CliSettings};
