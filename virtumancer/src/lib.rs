//! Virtumancer: manages virtual machines across a fleet of hypervisor hosts.
//!
//! Hosts are reached through the capability interface in `virtumancer-hv`.
//! The service keeps one connection per host, mirrors each host's domains into
//! a SQLite inventory, runs lifecycle tasks, detects drift between the stored
//! and the live definition, and streams telemetry to WebSocket clients.

pub mod config;
pub mod drift;
pub mod error;
pub mod events;
pub mod hub;
pub mod locks;
pub mod model;
pub mod orchestrator;
pub mod pool;
pub mod reconciler;
pub mod rest;
pub mod service;
pub mod settings;
pub mod store;
pub mod telemetry;

pub use config::{Args, ServiceConfig};
pub use error::{AppError, ErrorCode};
pub use service::Service;
pub use store::Store;
