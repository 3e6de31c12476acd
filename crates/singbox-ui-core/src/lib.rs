//! Core library for singbox-ui.
//!
//! Everything the tray front end needs below the widget layer lives here:
//! the single-instance lock and hand-off protocol, supervision of the
//! external sing-box binary, the application log file, deep links and
//! subscription storage. [`api::AppSupervisor`] ties them together.

pub mod api;
pub mod config;
pub mod deeplink;
pub mod instance;
pub mod ipc;
pub mod logfile;
pub mod retry;
pub mod subscription;
pub mod supervisor;
