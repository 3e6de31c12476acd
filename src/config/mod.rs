mod cli;

pub use cli::{merge_cli, Command, Config};
pub use singbox_ui_core::config::Settings;
