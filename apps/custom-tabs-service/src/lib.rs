//! Host process for the custom tabs connection service: environment-driven
//! configuration, procfs and HTTPS backed collaborators, and a JSON API over
//! the inbound connection calls.

pub mod asset_links;
pub mod config;
pub mod environment;
pub mod events;
pub mod identities;
pub mod keep_alive;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod surfaces;
pub mod telemetry;
