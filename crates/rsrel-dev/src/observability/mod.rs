//! Observability infrastructure for the developer sandbox.
//!
//! This module provides structured logging configuration.

mod logging;

pub use logging::{create_json_layer, init_logging, LoggingConfig};
