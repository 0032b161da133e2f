//! Shared plumbing for identity services
//!
//! Configuration loading, the configuration error type, and a redacting
//! wrapper for secrets read from the environment or from files.

pub mod config;
mod error;
mod secret;

pub use config::{load_toml, read_secret, resolve_path};
pub use error::{Error, Result};
pub use secret::Secret;
