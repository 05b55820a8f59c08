//! Error types for the wt-watcher crate.
//!
//! This module provides the [`WatchError`] type for errors surfaced to
//! callers of the watch registry.

use std::path::PathBuf;

use crate::source::SourceError;

/// Errors that can occur when registering or operating a watch.
///
/// # Error Recovery Strategy
///
/// - **Access denied** ([`WatchError::Access`]): Recoverable - the
///   registration is kept in a degraded state and rebinds when the
///   target's permissions change.
/// - **Link cycle** ([`WatchError::LinkCycle`]): Fatal for the registration -
///   the path cannot be resolved.
/// - **Watch limit** ([`WatchError::Exhausted`]): Fatal - the kernel refused
///   to register more watches.
/// - **Shutdown** ([`WatchError::Shutdown`]): Fatal - the registry is being
///   destroyed.
/// - **I/O errors** ([`WatchError::Io`]): Fatal - propagate immediately.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The kernel refused to install a watch on an existing object.
    #[error("access denied installing a watch on {0}")]
    Access(PathBuf),

    /// Symbolic-link resolution exceeded the configured bound.
    #[error("symbolic link chain for {path} exceeded {limit} links")]
    LinkCycle {
        /// The path whose resolution cycled.
        path: PathBuf,
        /// The configured chain bound.
        limit: usize,
    },

    /// The kernel cannot register more watches.
    #[error("kernel watch limit reached")]
    Exhausted,

    /// The registry is being destroyed; no further calls are accepted.
    #[error("watch tower is shutting down")]
    Shutdown,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WatchError {
    /// Returns `true` if this error leaves a usable (degraded) registration
    /// behind.
    ///
    /// Only [`WatchError::Access`] is recoverable: the item keeps its
    /// directory watch and rebinds when the target becomes accessible.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Access(_))
    }

    /// Returns `true` if this error means no usable registration exists.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }

    /// Returns the path associated with this error, if any.
    #[must_use]
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Access(path) | Self::LinkCycle { path, .. } => Some(path),
            Self::Exhausted | Self::Shutdown | Self::Io(_) => None,
        }
    }
}

impl From<SourceError> for WatchError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::AccessDenied(path) => Self::Access(path),
            SourceError::NotFound(path) => Self::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such path: {}", path.display()),
            )),
            SourceError::Exhausted => Self::Exhausted,
            SourceError::Io(err) => Self::Io(err),
        }
    }
}
