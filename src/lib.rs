//! Routekeeper - keeps a Traefik proxy in line with administrator settings
//!
//! This library:
//! - Rewrites the managed application's dynamic routing document for a new
//!   hostname and certificate mode
//! - Generates the proxy's main configuration and edits it in place
//! - Creates or updates the proxy's Swarm service against its live version
//! - Schedules named maintenance jobs such as the daily Docker cleanup

pub mod config;
pub mod docker;
pub mod dynamic;
pub mod error;
pub mod jobs;
pub mod routing;
pub mod service;
pub mod settings;
pub mod static_config;
pub mod store;

pub use error::{Error, Result};

/// Package name
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
