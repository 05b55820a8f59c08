//! Filesystem object identity.
//!
//! Watchers need to know whether a name that reappeared on disk refers to
//! the *same* underlying object as before (e.g. a file renamed away and
//! back) or to a replacement (e.g. an atomic-rename save). The
//! `(device, inode)` pair answers that question on the local host.

use std::fs::Metadata;
use std::io;
use std::path::Path;

/// Identity of a filesystem object: `(device id, inode number)`.
///
/// Inode numbers are only unique within a device, so both halves are
/// required to name an object unambiguously.
///
/// # Examples
///
/// ```no_run
/// use wt_core::ObjectIdentity;
///
/// let before = ObjectIdentity::from_path("/tmp/app.log".as_ref())?;
/// // ... the file is replaced via rename(2) ...
/// let after = ObjectIdentity::from_path("/tmp/app.log".as_ref())?;
/// assert_ne!(before, after, "atomic rename produced a new inode");
/// # Ok::<(), std::io::Error>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectIdentity {
    /// Device id the object lives on.
    pub dev: u64,
    /// Inode number within that device.
    pub ino: u64,
}

impl ObjectIdentity {
    /// Creates an identity from raw device and inode numbers.
    #[inline]
    #[must_use]
    pub const fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }

    /// Extracts the identity from already-fetched metadata.
    #[cfg(unix)]
    #[inline]
    #[must_use]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    /// Stats `path` (following symlinks) and returns the target's identity.
    ///
    /// # Errors
    ///
    /// Propagates the `io::Error` from `stat(2)`, notably `NotFound` when
    /// the path does not resolve to an existing object.
    #[cfg(unix)]
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self::from_metadata(&metadata))
    }
}

impl std::fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}:{:x}", self.dev, self.ino)
    }
}
