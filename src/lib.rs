//! Audit pipeline for an intercepting HTTP proxy.

pub mod audit;
pub mod capture;
pub mod config;
pub mod correlation;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod security;

pub use config::AuditConfig;
pub use error::{Error, Result};
pub use http::HttpServer;
pub use lifecycle::{RunningProxy, Shutdown};
