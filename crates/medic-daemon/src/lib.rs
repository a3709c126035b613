//! Medic Daemon - configuration, logging and process wiring
//!
//! The `medic` binary is a thin shell over this crate: it parses the
//! command line, loads [`MedicConfig`], installs tracing and hands a
//! [`medic_core::Reconciler`] to the polling [`medic_core::Monitor`].

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;

pub use app::{build_reconciler, clear_record, list_records, open_store, Secrets};
pub use cli::Invocation;
pub use config::{LogConfig, MedicConfig};
pub use error::{ConfigError, MedicError, Result};
