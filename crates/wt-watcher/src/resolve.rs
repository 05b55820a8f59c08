//! Symlink-aware path resolution.
//!
//! Decomposes a user path into the chain of symbolic links leading to its
//! final target, stats the target, and locates the deepest existing
//! ancestor directory of the target name. The result tells the registry
//! exactly which watches a path implies: one per link, one on the target
//! when it exists, and one on the ancestor directory either way.

use std::fs;
use std::path::{Path, PathBuf};

use wt_core::ObjectIdentity;

/// The decomposition of a user path against the live filesystem.
#[derive(Debug, Clone)]
pub(crate) struct Resolution {
    /// Every symbolic link read while expanding the path, outermost first.
    /// Empty when the user path is not a link.
    pub links: Vec<PathBuf>,
    /// The final name the path resolves to: the first non-link component,
    /// which may or may not exist.
    pub target: PathBuf,
    /// Identity of the target, when it exists.
    pub identity: Option<ObjectIdentity>,
    /// The deepest directory on the target's ancestor path that exists.
    /// Equals the target's parent whenever the target exists.
    pub deepest_dir: PathBuf,
}

impl Resolution {
    /// Returns `true` when the path currently resolves to an existing
    /// object.
    pub fn target_exists(&self) -> bool {
        self.identity.is_some()
    }
}

/// Errors from path resolution.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ResolveError {
    /// More links than the configured bound: almost certainly a cycle.
    #[error("symbolic link chain exceeded {0} links")]
    LinkCycle(usize),

    /// No ancestor directory of the target exists. Cannot happen for
    /// absolute paths on a rooted filesystem.
    #[error("no existing ancestor directory for {0}")]
    NoAncestor(PathBuf),
}

/// Resolves `path`, expanding symbolic links one at a time.
///
/// Relative link targets are interpreted against the link's own directory.
/// Resolution stops at the first component that is not a symlink, whether
/// or not it exists; a missing name is a first-class result, not an error.
/// No filesystem access happens beyond the resolution itself.
pub(crate) fn resolve(path: &Path, max_links: usize) -> Result<Resolution, ResolveError> {
    let mut links = Vec::new();
    let mut current = path.to_path_buf();

    let identity = loop {
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                if links.len() >= max_links {
                    return Err(ResolveError::LinkCycle(max_links));
                }
                let Ok(dest) = fs::read_link(&current) else {
                    // The link vanished between the two calls; treat the
                    // name as missing.
                    break None;
                };
                let next = if dest.is_absolute() {
                    dest
                } else {
                    match current.parent() {
                        Some(parent) => parent.join(&dest),
                        None => dest,
                    }
                };
                links.push(std::mem::replace(&mut current, next));
            }
            Ok(meta) => break Some(ObjectIdentity::from_metadata(&meta)),
            Err(_) => break None,
        }
    };

    let deepest_dir = deepest_existing_dir(&current)?;
    Ok(Resolution {
        links,
        target: current,
        identity,
        deepest_dir,
    })
}

/// Walks up from `target`'s parent to the first directory that exists.
pub(crate) fn deepest_existing_dir(target: &Path) -> Result<PathBuf, ResolveError> {
    let mut ancestor = target.parent();
    while let Some(dir) = ancestor {
        // A relative path's innermost ancestor is the empty string,
        // meaning the current directory.
        let probe = if dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            dir
        };
        match fs::metadata(probe) {
            Ok(meta) if meta.is_dir() => return Ok(probe.to_path_buf()),
            _ => {}
        }
        ancestor = dir.parent();
    }
    Err(ResolveError::NoAncestor(target.to_path_buf()))
}

/// The entry name inside `deepest_dir` whose creation, deletion, or rename
/// can change what `resolution.target` refers to.
///
/// When the target exists this is its basename; when it is missing it is
/// the first component of the remaining path below the deepest existing
/// directory.
pub(crate) fn pivot_name(resolution: &Resolution) -> Option<std::ffi::OsString> {
    // A relative target has no "." prefix to strip even though its
    // deepest existing directory is reported as ".".
    let rest = match resolution.target.strip_prefix(&resolution.deepest_dir) {
        Ok(rest) => rest,
        Err(_) if resolution.deepest_dir == Path::new(".") => resolution.target.as_path(),
        Err(_) => return None,
    };
    rest.components()
        .next()
        .map(|c| c.as_os_str().to_os_string())
}
