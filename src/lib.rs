//! singbox-ui: headless front end for the sing-box proxy core.
//!
//! The binary parses the command line, sets up logging and hands over to
//! [`app::run`]; everything below that lives in `singbox-ui-core`.

pub mod app;
pub mod config;
