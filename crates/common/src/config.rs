//! Config file resolution and loading
//!
//! Precedence for the config path: CLI argument, then an environment
//! variable, then a default file name. Secrets never live in the TOML; they
//! come from an environment variable or a separate file.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::secret::Secret;

/// Resolve the config file path from a CLI arg, then `env_var`, then `default`.
pub fn resolve_path(cli_path: Option<&str>, env_var: &str, default: &str) -> PathBuf {
    if let Some(p) = cli_path {
        return PathBuf::from(p);
    }
    if let Ok(p) = std::env::var(env_var) {
        return PathBuf::from(p);
    }
    PathBuf::from(default)
}

/// Read and deserialize a TOML file.
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| Error::Toml {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolve a secret: `env_var` takes precedence over `file`.
///
/// File contents are trimmed; an empty value counts as absent. A configured
/// file that cannot be read is an error.
pub fn read_secret(env_var: &str, file: Option<&Path>) -> Result<Option<Secret<String>>> {
    if let Ok(value) = std::env::var(env_var) {
        let value = value.trim().to_owned();
        if !value.is_empty() {
            return Ok(Some(Secret::new(value)));
        }
    }
    let Some(file) = file else {
        return Ok(None);
    };
    let contents = std::fs::read_to_string(file).map_err(|e| {
        Error::Config(format!("failed to read secret file {}: {e}", file.display()))
    })?;
    let value = contents.trim().to_owned();
    Ok((!value.is_empty()).then(|| Secret::new(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Sample {
        name: String,
        #[serde(default)]
        retries: u32,
    }

    #[test]
    fn cli_path_wins() {
        let path = resolve_path(Some("/tmp/explicit.toml"), "COMMON_TEST_UNSET_VAR", "default.toml");
        assert_eq!(path, PathBuf::from("/tmp/explicit.toml"));
    }

    #[test]
    fn falls_back_to_default_path() {
        let path = resolve_path(None, "COMMON_TEST_UNSET_VAR", "default.toml");
        assert_eq!(path, PathBuf::from("default.toml"));
    }

    #[test]
    fn load_toml_applies_serde_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.toml");
        std::fs::write(&path, "name = \"scraper\"").unwrap();

        let sample: Sample = load_toml(&path).unwrap();
        assert_eq!(sample.name, "scraper");
        assert_eq!(sample.retries, 0);
    }

    #[test]
    fn load_toml_missing_file_is_io_error() {
        let result: Result<Sample> = load_toml(Path::new("/nonexistent/sample.toml"));
        assert!(matches!(result, Err(Error::Io { .. })));
    }

    #[test]
    fn load_toml_invalid_syntax_is_toml_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "not valid {{{{ toml").unwrap();

        let result: Result<Sample> = load_toml(&path);
        assert!(matches!(result, Err(Error::Toml { .. })));
    }

    #[test]
    fn read_secret_trims_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "  tok_123\n").unwrap();

        let secret = read_secret("COMMON_TEST_UNSET_VAR", Some(&path)).unwrap().unwrap();
        assert_eq!(secret.expose(), "tok_123");
    }

    #[test]
    fn read_secret_empty_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "\n").unwrap();

        assert!(read_secret("COMMON_TEST_UNSET_VAR", Some(&path)).unwrap().is_none());
    }

    #[test]
    fn read_secret_missing_file_is_error() {
        let result = read_secret("COMMON_TEST_UNSET_VAR", Some(Path::new("/nonexistent/token")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn read_secret_without_sources_is_absent() {
        assert!(read_secret("COMMON_TEST_UNSET_VAR", None).unwrap().is_none());
    }
}
