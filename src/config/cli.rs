use clap::{Parser, Subcommand};
use std::path::PathBuf;

use singbox_ui_core::config::Settings;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Tray front end for the sing-box proxy core")]
pub struct Config {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Replace the running instance instead of forwarding to it
    #[arg(long)]
    pub restart: bool,

    /// Do not start sing-box even if autostart is enabled
    #[arg(long)]
    pub no_autostart: bool,

    /// Subscription links to import (http(s)://, sing-box://, singbox-ui://)
    pub args: Vec<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the version of the configured sing-box binary
    Version,
    /// Ask a running sing-box to reload its config
    Reload,
}

impl Config {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Apply command line overrides to loaded settings
pub fn merge_cli(settings: &mut Settings, cli: &Config) {
    if cli.no_autostart {
        settings.core.autostart = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_deep_link_arguments() {
        let cli = Config::parse_from(["singbox-ui", "https://example.com/sub#tag_name"]);
        assert_eq!(cli.args, vec!["https://example.com/sub#tag_name"]);
        assert!(cli.command.is_none());
        assert!(!cli.restart);
    }

    #[test]
    fn test_flags() {
        let cli = Config::parse_from([
            "singbox-ui",
            "--restart",
            "--no-autostart",
            "-d",
            "--config",
            "/tmp/custom.toml",
        ]);
        assert!(cli.restart);
        assert!(cli.no_autostart);
        assert!(cli.debug);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/custom.toml")));
        assert!(cli.args.is_empty());
    }

    #[test]
    fn test_subcommands() {
        let cli = Config::parse_from(["singbox-ui", "version"]);
        assert_eq!(cli.command, Some(Command::Version));

        let cli = Config::parse_from(["singbox-ui", "--debug", "reload"]);
        assert_eq!(cli.command, Some(Command::Reload));
        assert!(cli.debug);
        assert!(cli.args.is_empty());
    }

    #[test]
    fn test_global_flags_around_subcommands() {
        let cli = Config::parse_from(["singbox-ui", "-c", "x.toml", "version"]);
        assert_eq!(cli.command, Some(Command::Version));
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert!(cli.args.is_empty());

        let cli = Config::parse_from(["singbox-ui", "reload", "-d"]);
        assert_eq!(cli.command, Some(Command::Reload));
        assert!(cli.debug);
    }

    #[test]
    fn test_merge_cli_disables_autostart() {
        let mut settings = Settings::default();
        settings.core.autostart = true;

        merge_cli(&mut settings, &Config::parse_from(["singbox-ui"]));
        assert!(settings.core.autostart);

        merge_cli(&mut settings, &Config::parse_from(["singbox-ui", "--no-autostart"]));
        assert!(!settings.core.autostart);
    }
}
