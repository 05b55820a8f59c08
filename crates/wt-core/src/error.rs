//! Error types for the wt-core crate.
//!
//! This module provides the [`ConfigError`] type for configuration-related
//! errors that can occur across the workspace.

/// Errors that can occur during configuration loading and validation.
///
/// # Examples
///
/// ```
/// use wt_core::ConfigError;
///
/// let error = ConfigError::InvalidOption {
///     option: "max_link_depth".to_owned(),
///     reason: "must be at least 1".to_owned(),
/// };
/// assert!(error.to_string().contains("max_link_depth"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A configuration option has an invalid value.
    #[error("invalid configuration option '{option}': {reason}")]
    InvalidOption {
        /// The name of the invalid option.
        option: String,
        /// Explanation of why the option is invalid.
        reason: String,
    },

    /// An I/O error occurred while reading configuration.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_option_display() {
        let error = ConfigError::InvalidOption {
            option: "event_buffer_bytes".to_owned(),
            reason: "must hold at least one kernel event".to_owned(),
        };
        let msg = error.to_string();
        assert!(msg.contains("event_buffer_bytes"));
        assert!(msg.contains("at least one"));
    }

    #[test]
    fn test_io_display() {
        let error = ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such file",
        ));
        assert!(error.to_string().contains("failed to read configuration"));
    }
}
