//! kURL bundler HTTP server.
//!
//! Streams installer bundles, reports health and forwards everything else
//! to the upstream installer API.

#![allow(clippy::result_large_err)]

pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod lint;
pub mod proxy;
pub mod server;
pub mod state;

pub use error::{bundle_error_response, report_error};
pub use handler::HealthzResponse;
pub use lifecycle::{DrainController, StreamGuard, StreamTracker};
pub use lint::{HttpLinter, InstallerLinter, LintMessage};
pub use server::{create_app, serve};
pub use state::AppState;

/// Bundler server version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
