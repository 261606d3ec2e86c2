//! Configuration validation support.
//!
//! Each component owns its config struct (`PoolConfig`, `GatherConfig`,
//! `DispatcherConfig`) next to the code it configures; this module holds the
//! shared validation error they all return.

use thiserror::Error;

/// Result alias for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// A configuration value failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {message}")]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Create a validation error tied to a named field.
    pub fn field(name: &str, problem: impl AsRef<str>) -> Self {
        Self {
            message: format!("field '{name}': {}", problem.as_ref()),
        }
    }

    /// The validation message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Validates that a component name is usable as a log/metrics identifier.
///
/// Names appear verbatim in structured log events, so the same constraints
/// apply everywhere a component takes one.
pub(crate) fn validate_name(name: &str) -> ConfigResult<()> {
    if name.is_empty() {
        return Err(ConfigError::field("name", "must not be empty"));
    }
    if name.len() > 128 {
        return Err(ConfigError::field("name", "must be at most 128 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ConfigError::field(
            "name",
            "may only contain alphanumerics, '-', '_' and '.'",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_errors_name_the_field() {
        let err = ConfigError::field("capacity", "must be greater than 0");
        assert_eq!(
            err.to_string(),
            "invalid configuration: field 'capacity': must be greater than 0"
        );
    }

    #[test]
    fn names_are_validated() {
        assert!(validate_name("dashboard-pool").is_ok());
        assert!(validate_name("a.b_c-1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has spaces").is_err());
        assert!(validate_name(&"x".repeat(129)).is_err());
    }
}
