//! Public API layer (Facade) for singbox-ui-core.
//!
//! [`AppSupervisor`] owns the primary instance's resources and exposes the
//! operations a frontend or the headless event loop needs.
//!
//! # Quick Start
//!
//! ```ignore
//! use singbox_ui_core::api::{AppSupervisor, AppSupervisorBuilder};
//!
//! let mut core = AppSupervisorBuilder::new(settings)
//!     .with_lock(lock)
//!     .with_ipc_server(server)
//!     .build()?;
//!
//! let mut events = core.subscribe();
//! core.start_core().await;
//! ```

mod actions;
mod builder;
mod core;
pub mod events;

pub use builder::AppSupervisorBuilder;
pub use core::AppSupervisor;
pub use events::{AppEvent, FetchOutcome, IpcFlow};
