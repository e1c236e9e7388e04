//! Structured logging.
//!
//! # Responsibilities
//! - Initialize logging subsystem
//! - Pick the default filter from the verbosity flag
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, human-readable format for development
//! - `RUST_LOG` always wins over the verbosity flag

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default directives when `RUST_LOG` is unset.
pub fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "mitm_audit=debug,tower_http=debug"
    } else {
        "mitm_audit=info,tower_http=warn"
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(verbose: bool, json: bool) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    }
}
