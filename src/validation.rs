use regex::Regex;

use crate::error::{Error, Result};

/// Syntax checks for caller-supplied keys.
///
/// Group and endpoint keys become map keys in per-key state, so junk
/// input must be rejected before it can mint unbounded entries.
pub struct KeyValidator {
    key_pattern: Regex,
}

impl Default for KeyValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValidator {
    pub fn new() -> Self {
        Self {
            // Compile-time constant pattern; unwrap cannot fire at runtime.
            key_pattern: Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:/-]{0,127}$").unwrap(),
        }
    }

    pub fn validate_group_key(&self, key: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(Error::Validation("group key cannot be empty".into()));
        }
        if !self.key_pattern.is_match(key) {
            return Err(Error::Validation(format!(
                "group key '{key}' may only contain alphanumerics, dots, underscores, colons, slashes and hyphens (max 128 chars)"
            )));
        }
        Ok(())
    }

    pub fn validate_endpoint_key(&self, key: &str) -> Result<()> {
        let trimmed = key.trim_start_matches('/');
        if trimmed.is_empty() {
            return Err(Error::Validation("endpoint key cannot be empty".into()));
        }
        if !self.key_pattern.is_match(trimmed) {
            return Err(Error::Validation(format!("invalid endpoint key '{key}'")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_group_keys() {
        let v = KeyValidator::new();
        assert!(v.validate_group_key("mon-1").is_ok());
        assert!(v.validate_group_key("observer_2.screen").is_ok());
        assert!(v.validate_group_key("client:10.0.0.1").is_ok());
    }

    #[test]
    fn test_invalid_group_keys() {
        let v = KeyValidator::new();
        assert!(v.validate_group_key("").is_err());
        assert!(v.validate_group_key("has space").is_err());
        assert!(v.validate_group_key("-leading-dash").is_err());
        assert!(v.validate_group_key(&"x".repeat(200)).is_err());
    }

    #[test]
    fn test_endpoint_keys_allow_leading_slash() {
        let v = KeyValidator::new();
        assert!(v.validate_endpoint_key("/events/screen").is_ok());
        assert!(v.validate_endpoint_key("events/text").is_ok());
        assert!(v.validate_endpoint_key("/").is_err());
    }
}
