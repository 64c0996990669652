//! # upjob Common
//!
//! Shared utilities for the upjob crates.
//!
//! ## Logging
//!
//! ```no_run
//! use upjob_common::{init_logging_with, LogFormat};
//!
//! init_logging_with("info", LogFormat::Json).unwrap();
//! tracing::info!(classification = "system", "Download started");
//! ```

pub mod logging;

pub use logging::{
    init_logging,
    init_logging_json,
    init_logging_with,
    LogFormat,
};
