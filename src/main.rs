use std::process::ExitCode;

use chrono::Utc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use singbox_ui::config::{merge_cli, Config, Settings};
use singbox_ui_core::logfile::LogFile;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments
    let cli = Config::parse_args();

    // Load settings
    let mut settings = match Settings::load(cli.config.as_ref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("singbox-ui: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    merge_cli(&mut settings, &cli);
    settings.validate();

    // Log file is truncated at most once per rotation window
    let log = LogFile::new(&settings.logging.file, settings.logging.rotate_hours);
    if let Err(e) = log.rotate_if_due(Utc::now()) {
        eprintln!("singbox-ui: cannot rotate {}: {}", log.path().display(), e);
    }

    // Setup logging
    setup_logging(cli.debug, &log);
    install_panic_hook(log.clone());

    // Run the application
    match singbox_ui::app::run(cli, settings, log.clone()).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("singbox-ui failed, see {}", log.path().display());
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(debug: bool, log: &LogFile) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("singbox_ui=debug,singbox_ui_core=debug")
        } else {
            EnvFilter::new("singbox_ui=info,singbox_ui_core=info")
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(log.clone()),
        )
        .init();
}

/// Record panics in the log file before the default hook prints them
fn install_panic_hook(log: LogFile) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = log.append_line(&format!("panic: {}", info));
        default_hook(info);
    }));
}
