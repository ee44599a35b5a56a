//! # mdb Utilities
//!
//! Shared helpers for the mdb workspace. Currently this is the `tracing`
//! subscriber setup used by the CLI.

pub mod logging;

pub use logging::{init_logging, init_logging_with_level, LogFormat, LogLevel, LoggingError, LoggingGuard};
pub use tracing::{debug, error, info, trace, warn};
