//! Configuration for the file watcher.
//!
//! [`WatchConfig`] gathers the tuning knobs of the watcher core. All fields
//! have sensible defaults; loading from a JSON file is supported for
//! embedding applications that expose these knobs to users.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default bound on the length of a symbolic-link chain.
///
/// Resolution that walks more links than this is treated as a cycle. Forty
/// matches the kernel's own `ELOOP` limit.
pub const DEFAULT_MAX_LINK_DEPTH: usize = 40;

/// Default size in bytes of the kernel event read buffer.
pub const DEFAULT_EVENT_BUFFER_BYTES: usize = 16 * 1024;

/// Default capacity of the async change-stream channel.
pub const DEFAULT_STREAM_CAPACITY: usize = 16;

/// A kernel event record needs room for the fixed header plus a filename;
/// buffers smaller than this cannot hold a single event.
const MIN_EVENT_BUFFER_BYTES: usize = 1024;

/// Configuration for the watcher core.
///
/// # Examples
///
/// ```
/// use wt_core::WatchConfig;
///
/// let config = WatchConfig::default();
/// assert_eq!(config.max_link_depth, 40);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Maximum number of symbolic links followed while resolving a watched
    /// path. Exceeding the bound is reported as a link cycle.
    pub max_link_depth: usize,

    /// Size in bytes of the buffer used to read raw kernel events.
    ///
    /// Larger buffers drain bursts in fewer syscalls; the kernel signals
    /// queue overrun independently of this value.
    pub event_buffer_bytes: usize,

    /// Capacity of the channel behind an async change stream.
    ///
    /// Notifications carry no payload, so a full channel simply coalesces
    /// further changes into the ones already queued.
    pub stream_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            max_link_depth: DEFAULT_MAX_LINK_DEPTH,
            event_buffer_bytes: DEFAULT_EVENT_BUFFER_BYTES,
            stream_capacity: DEFAULT_STREAM_CAPACITY,
        }
    }
}

impl WatchConfig {
    /// Checks every option for a usable value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] naming the first offending
    /// option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_link_depth == 0 {
            return Err(ConfigError::InvalidOption {
                option: "max_link_depth".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if self.event_buffer_bytes < MIN_EVENT_BUFFER_BYTES {
            return Err(ConfigError::InvalidOption {
                option: "event_buffer_bytes".to_owned(),
                reason: format!("must be at least {MIN_EVENT_BUFFER_BYTES} bytes"),
            });
        }
        if self.stream_capacity == 0 {
            return Err(ConfigError::InvalidOption {
                option: "stream_capacity".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        Ok(())
    }

    /// Loads and validates a configuration from a JSON file.
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Parse`] on malformed JSON, or
    /// [`ConfigError::InvalidOption`] if a value fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }
}
