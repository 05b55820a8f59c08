//! The kernel-facing change primitive.
//!
//! [`ChangeSource`] abstracts the operating system's filesystem
//! notification facility: install a watch on a filesystem object or a
//! directory, get back an opaque [`WatchHandle`], and read a stream of
//! [`RawEvent`]s. Everything above this trait is portable; implementing it
//! is the only per-OS work. Linux is served by [`linux::InotifySource`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(test)]
pub(crate) mod mock;

/// Opaque token for an installed watch.
///
/// Handles are issued by a [`ChangeSource`] and are the only thing it
/// accepts for uninstallation. A source may hand out the *same* handle for
/// two installs that land on the same kernel object (inotify deduplicates
/// watches per inode); callers that install speculatively must therefore
/// reference-count handles rather than assume exclusive ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(u64);

impl WatchHandle {
    /// Handle value carried by events that belong to no specific watch,
    /// such as [`RawEventKind::Overflow`].
    pub const NULL: Self = Self(0);

    /// Wraps a raw handle value, for [`ChangeSource`] implementations
    /// issuing handles. Start numbering at 1; 0 is reserved for
    /// [`Self::NULL`].
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw handle value.
    #[inline]
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What happened, as reported by the kernel.
///
/// The first five kinds are produced by watches on filesystem objects
/// (files or symlinks) and describe the object itself; the `Entry*` kinds
/// are produced by directory watches and describe a named entry within the
/// directory, carried in [`RawEvent::name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    /// The object's data changed (bytes appended, rewritten, or truncated).
    Modified,
    /// The object's metadata changed (permissions, ownership, link count).
    AttribChanged,
    /// The last name for this object is gone; the watch is dead.
    Removed,
    /// The object was renamed away from the watched name.
    RenamedSelf,
    /// A directory entry was created.
    EntryCreated,
    /// A directory entry was deleted.
    EntryDeleted,
    /// A directory entry was renamed away; pairs with [`Self::RenamedTo`]
    /// through [`RawEvent::cookie`].
    RenamedFrom,
    /// A directory entry was renamed into place; pairs with
    /// [`Self::RenamedFrom`] through [`RawEvent::cookie`].
    RenamedTo,
    /// The kernel event queue overran; an unknown number of events were
    /// lost and consumers must resynchronise by full re-resolution.
    Overflow,
}

impl RawEventKind {
    /// Returns `true` for kinds that describe a named directory entry.
    #[inline]
    #[must_use]
    pub const fn is_entry_event(self) -> bool {
        matches!(
            self,
            Self::EntryCreated | Self::EntryDeleted | Self::RenamedFrom | Self::RenamedTo
        )
    }
}

/// A single raw notification from the kernel.
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// The watch that produced this event ([`WatchHandle::NULL`] for
    /// [`RawEventKind::Overflow`]).
    pub handle: WatchHandle,
    /// What happened.
    pub kind: RawEventKind,
    /// Entry name, for directory-entry events.
    pub name: Option<OsString>,
    /// Correlation cookie pairing the two halves of a rename.
    pub cookie: Option<u32>,
}

impl RawEvent {
    /// Creates an event describing the watched object itself.
    #[must_use]
    pub fn on(handle: WatchHandle, kind: RawEventKind) -> Self {
        Self {
            handle,
            kind,
            name: None,
            cookie: None,
        }
    }

    /// Creates a directory-entry event.
    #[must_use]
    pub fn entry(handle: WatchHandle, kind: RawEventKind, name: impl Into<OsString>) -> Self {
        Self {
            handle,
            kind,
            name: Some(name.into()),
            cookie: None,
        }
    }

    /// Creates a directory-entry rename event with its correlation cookie.
    #[must_use]
    pub fn rename(
        handle: WatchHandle,
        kind: RawEventKind,
        name: impl Into<OsString>,
        cookie: u32,
    ) -> Self {
        Self {
            handle,
            kind,
            name: Some(name.into()),
            cookie: Some(cookie),
        }
    }

    /// The queue-overrun marker.
    #[must_use]
    pub fn overflow() -> Self {
        Self::on(WatchHandle::NULL, RawEventKind::Overflow)
    }
}

/// Errors produced by a [`ChangeSource`].
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The kernel refused to install a watch on an existing object.
    #[error("access denied installing a watch on {0}")]
    AccessDenied(PathBuf),

    /// The path to watch does not exist.
    #[error("no such path: {0}")]
    NotFound(PathBuf),

    /// The kernel cannot register more watches.
    #[error("kernel watch limit reached")]
    Exhausted,

    /// Any other I/O failure.
    #[error("change source I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The platform primitive turning kernel filesystem events into a polled
/// stream.
///
/// Implementations are shared between the thread that installs and removes
/// watches and the worker thread that polls, so every method takes `&self`
/// and must be internally synchronized.
pub trait ChangeSource: Send + Sync + 'static {
    /// Installs a watch on an existing filesystem object.
    ///
    /// A trailing symlink is *not* followed: watching a link watches the
    /// link object itself, which is what a resolver that decomposes chains
    /// needs. The event stream for the handle reports at minimum:
    /// [`RawEventKind::Modified`], [`RawEventKind::AttribChanged`],
    /// [`RawEventKind::Removed`], and [`RawEventKind::RenamedSelf`].
    ///
    /// # Errors
    ///
    /// [`SourceError::AccessDenied`] if the kernel refuses,
    /// [`SourceError::NotFound`] if the object is gone,
    /// [`SourceError::Exhausted`] at the kernel watch limit.
    fn add_file(&self, path: &Path) -> Result<WatchHandle, SourceError>;

    /// Installs a watch on an existing directory.
    ///
    /// The event stream reports per-entry [`RawEventKind::EntryCreated`],
    /// [`RawEventKind::EntryDeleted`], and cookie-paired
    /// [`RawEventKind::RenamedFrom`]/[`RawEventKind::RenamedTo`].
    ///
    /// # Errors
    ///
    /// As for [`Self::add_file`].
    fn add_dir(&self, path: &Path) -> Result<WatchHandle, SourceError>;

    /// Uninstalls a watch.
    ///
    /// Idempotent: removing a handle twice, or removing a handle the kernel
    /// already invalidated (e.g. because the object was deleted), is
    /// silently absorbed.
    fn remove(&self, handle: WatchHandle);

    /// Blocks until at least one event is available or [`Self::wake`] is
    /// called, then returns the drained batch (empty on a bare wake).
    ///
    /// # Errors
    ///
    /// A persistent read failure from the kernel; the caller treats this as
    /// fatal.
    fn poll(&self) -> Result<Vec<RawEvent>, SourceError>;

    /// Causes a blocked [`Self::poll`] to return promptly so the event loop
    /// can observe registry changes.
    fn wake(&self);
}
