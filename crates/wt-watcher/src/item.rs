//! Per-path watch state.
//!
//! A [`WatchedItem`] aggregates everything the registry holds for one
//! registered path: the symlink chain and its watches, the watch on the
//! final target (when it exists), the directory watch used to detect
//! reappearance, and the subscribers to notify.

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use smallvec::SmallVec;

use wt_core::ObjectIdentity;

use crate::source::WatchHandle;

/// A registered callback plus the token that proves its owner is alive.
///
/// The callback is only invoked while `alive` still upgrades; the strong
/// side of the token lives in the `Registration`, so a released
/// registration can never be called back.
pub(crate) struct Subscriber {
    pub id: u64,
    pub callback: Arc<dyn Fn() + Send + Sync>,
    pub alive: Weak<()>,
}

/// A watch on one symbolic link in the chain.
#[derive(Debug, Clone)]
pub(crate) struct LinkWatch {
    pub path: PathBuf,
    pub handle: WatchHandle,
}

/// The watch on the final, existing target of the path.
#[derive(Debug, Clone)]
pub(crate) struct TargetWatch {
    pub path: PathBuf,
    pub handle: WatchHandle,
    pub identity: ObjectIdentity,
}

/// The watch on the deepest existing ancestor directory, with the entry
/// names whose appearance or disappearance affects the watched path.
#[derive(Debug, Clone)]
pub(crate) struct DirWatch {
    pub path: PathBuf,
    pub handle: WatchHandle,
    pub names: SmallVec<[OsString; 2]>,
}

/// State for a single registered path.
pub(crate) struct WatchedItem {
    /// The path exactly as the caller registered it, re-resolved on every
    /// rebind.
    pub path: PathBuf,
    pub links: SmallVec<[LinkWatch; 2]>,
    pub target: Option<TargetWatch>,
    pub dir: Option<DirWatch>,
    pub subscribers: Vec<Subscriber>,
}

impl WatchedItem {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            links: SmallVec::new(),
            target: None,
            dir: None,
            subscribers: Vec::new(),
        }
    }

    /// Identity of the current target, if it exists.
    pub fn identity(&self) -> Option<ObjectIdentity> {
        self.target.as_ref().map(|t| t.identity)
    }

    /// All handles this item holds, in no particular order.
    pub fn handles(&self) -> impl Iterator<Item = WatchHandle> + '_ {
        self.target
            .iter()
            .map(|t| t.handle)
            .chain(self.dir.iter().map(|d| d.handle))
            .chain(self.links.iter().map(|l| l.handle))
    }

    /// Returns `true` if any of this item's watches is `handle`.
    pub fn uses_handle(&self, handle: WatchHandle) -> bool {
        self.handles().any(|h| h == handle)
    }

    /// Which of this item's watches produced an event on `handle`.
    pub fn role_of(&self, handle: WatchHandle) -> Option<WatchRole> {
        if self.target.as_ref().is_some_and(|t| t.handle == handle) {
            Some(WatchRole::Target)
        } else if self.dir.as_ref().is_some_and(|d| d.handle == handle) {
            Some(WatchRole::Dir)
        } else if self.links.iter().any(|l| l.handle == handle) {
            Some(WatchRole::Link)
        } else {
            None
        }
    }

    /// Returns `true` if a directory entry named `name` is one this item
    /// watches for.
    pub fn matches_entry(&self, name: &OsStr) -> bool {
        self.dir
            .as_ref()
            .is_some_and(|d| d.names.iter().any(|n| n == name))
    }
}

impl std::fmt::Debug for WatchedItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchedItem")
            .field("path", &self.path)
            .field("links", &self.links)
            .field("target", &self.target)
            .field("dir", &self.dir)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

/// The role a handle plays within one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchRole {
    Target,
    Dir,
    Link,
}
