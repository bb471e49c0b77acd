//! remon - restart your server on every save.
//!
//! Watches a project, rebuilds and restarts the application when sources
//! change, and serves an error page on the application's port while it is
//! broken.
//!
//! ```text
//! FsWatcher ──► Supervisor ──► RestartController ──► ProcessLoader ──► app
//!                                   │                      ▲
//!                                   ▼                      │ control channel
//!                           DiagnosticServer          client::Readiness
//! ```
//!
//! Supervised applications link this crate for [`client::Readiness`].

pub mod logger;

pub mod cli;
pub mod client;
pub mod config;
pub mod diagnostic;
pub mod loader;
pub mod protocol;
pub mod supervisor;
pub mod utils;
pub mod watch;
