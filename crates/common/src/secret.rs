//! Redacting wrapper for credentials

use std::fmt;
use zeroize::Zeroize;

/// Sensitive value: redacted in Debug/Display and zeroed on drop.
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Borrow the inner value. Keep the borrow out of logs.
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_never_appears_in_formatting() {
        let secret = Secret::new(String::from("factory-token"));
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(secret.to_string(), "[REDACTED]");

        let wrapped = Some(secret);
        assert!(!format!("{wrapped:?}").contains("factory-token"));
    }

    #[test]
    fn clones_expose_same_value() {
        let secret = Secret::new(String::from("factory-token"));
        let copy = secret.clone();
        drop(secret);
        assert_eq!(copy.expose(), "factory-token");
    }
}
