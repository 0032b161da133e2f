//! Configuration error type

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading host configuration.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {}: {source}", path.display())]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_names_the_file() {
        let err = Error::Io {
            path: PathBuf::from("/etc/broker.toml"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
        };
        let message = err.to_string();
        assert!(message.contains("/etc/broker.toml"), "got: {message}");
        assert!(message.contains("file not found"), "got: {message}");
    }

    #[test]
    fn config_error_display() {
        let err = Error::Config("duplicate pool name: scraper".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: duplicate pool name: scraper"
        );
    }
}
