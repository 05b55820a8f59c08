//! The watch registry.
//!
//! [`WatchTower`] maps registered paths to [`WatchedItem`]s, owns the
//! [`ChangeSource`], and runs the worker thread that turns raw kernel
//! events into callbacks. All registry state sits behind a single mutex;
//! the mutex is never held while a callback runs.
//!
//! Watch handles are reference-counted here because a source may hand out
//! the same handle for two installs that land on the same kernel object
//! (inotify watches are per inode). A handle is uninstalled only when its
//! last user lets go.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use wt_core::{FxHashMap, WatchConfig};

use crate::error::WatchError;
use crate::item::{DirWatch, LinkWatch, Subscriber, TargetWatch, WatchedItem};
use crate::resolve::{self, Resolution, ResolveError};
use crate::source::{ChangeSource, SourceError, WatchHandle};
use crate::worker;

/// Registry state guarded by the single mutex.
pub(crate) struct TowerState {
    pub(crate) items: HashMap<PathBuf, WatchedItem>,
    pub(crate) handle_refs: FxHashMap<WatchHandle, usize>,
    pub(crate) next_subscriber: u64,
    pub(crate) shutdown: bool,
    pub(crate) dispatching: bool,
    pub(crate) worker: Option<ThreadId>,
}

/// Everything shared between the registry facade, registrations, and the
/// worker thread.
pub(crate) struct TowerInner {
    pub(crate) source: Arc<dyn ChangeSource>,
    pub(crate) config: WatchConfig,
    pub(crate) state: Mutex<TowerState>,
    pub(crate) dispatch_done: Condvar,
}

impl TowerInner {
    /// Removes subscriber `id` from `path`, releasing the item's watches
    /// when the last subscriber leaves.
    ///
    /// Waits out any dispatch cycle in flight first, so that once this
    /// returns no callback for the subscriber can run.
    pub(crate) fn unregister(&self, path: &Path, id: u64) {
        let mut state = self.state.lock();
        if state.worker == Some(thread::current().id()) {
            if state.dispatching {
                panic!("a Registration must not be dropped from inside a change callback");
            }
        } else {
            while state.dispatching {
                self.dispatch_done.wait(&mut state);
            }
        }
        if state.shutdown {
            // Teardown already released every watch.
            return;
        }

        let now_empty = match state.items.get_mut(path) {
            Some(item) => {
                item.subscribers.retain(|s| s.id != id);
                item.subscribers.is_empty()
            }
            None => false,
        };
        if now_empty {
            if let Some(item) = state.items.remove(path) {
                debug!(path = %path.display(), "releasing last registration for path");
                let handles: SmallVec<[WatchHandle; 4]> = item.handles().collect();
                for handle in handles {
                    release_handle(&mut state, self.source.as_ref(), handle);
                }
            }
        }
        drop(state);
        self.source.wake();
    }
}

/// The file-change notification registry.
///
/// Construction starts a worker thread that polls the [`ChangeSource`] and
/// invokes callbacks; dropping the tower stops the worker, releases every
/// watch, and invalidates outstanding [`Registration`]s (their release
/// becomes a no-op).
///
/// # Examples
///
/// ```no_run
/// use wt_watcher::WatchTower;
///
/// # fn main() -> Result<(), wt_watcher::WatchError> {
/// let tower = WatchTower::new()?;
/// let _registration = tower.register("/tmp/app.log", || {
///     println!("changed");
/// })?;
/// # Ok(())
/// # }
/// ```
pub struct WatchTower {
    pub(crate) inner: Arc<TowerInner>,
    worker: Option<JoinHandle<()>>,
}

impl WatchTower {
    /// Creates a registry backed by the platform change source.
    ///
    /// # Errors
    ///
    /// Propagates failures initializing the kernel primitive or spawning
    /// the worker thread.
    #[cfg(target_os = "linux")]
    pub fn new() -> Result<Self, WatchError> {
        Self::with_config(WatchConfig::default())
    }

    /// Creates a registry backed by the platform change source, with
    /// explicit configuration.
    ///
    /// # Errors
    ///
    /// As for [`Self::new`].
    #[cfg(target_os = "linux")]
    pub fn with_config(config: WatchConfig) -> Result<Self, WatchError> {
        let source = Arc::new(crate::source::linux::InotifySource::new(
            config.event_buffer_bytes,
        )?);
        Self::with_source_and_config(source, config)
    }

    /// Creates a registry over an arbitrary change source.
    ///
    /// This is the portability and test seam: any [`ChangeSource`]
    /// implementation works.
    ///
    /// # Errors
    ///
    /// Fails only if the worker thread cannot be spawned.
    pub fn with_source(source: Arc<dyn ChangeSource>) -> Result<Self, WatchError> {
        Self::with_source_and_config(source, WatchConfig::default())
    }

    /// [`Self::with_source`] with explicit configuration.
    ///
    /// # Errors
    ///
    /// Fails only if the worker thread cannot be spawned.
    pub fn with_source_and_config(
        source: Arc<dyn ChangeSource>,
        config: WatchConfig,
    ) -> Result<Self, WatchError> {
        let inner = Arc::new(TowerInner {
            source,
            config,
            state: Mutex::new(TowerState {
                items: HashMap::new(),
                handle_refs: FxHashMap::default(),
                next_subscriber: 1,
                shutdown: false,
                dispatching: false,
                worker: None,
            }),
            dispatch_done: Condvar::new(),
        });
        let worker_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("wt-watcher".to_owned())
            .spawn(move || worker::run(worker_inner))?;
        Ok(Self {
            inner,
            worker: Some(handle),
        })
    }

    /// Registers interest in `path` and returns the scoped handle that
    /// keeps the watch alive.
    ///
    /// The path does not have to exist: registration then installs only a
    /// watch on its nearest existing ancestor directory, and the callback
    /// fires when the path appears. The callback runs on the worker thread
    /// with no payload and should do bounded work; it must not call back
    /// into this registry.
    ///
    /// Registering the same path twice is fine; each registration receives
    /// its own callback per observable change.
    ///
    /// # Errors
    ///
    /// [`WatchError::LinkCycle`] if the path's symlink chain cycles,
    /// [`WatchError::Exhausted`] at the kernel watch limit, and
    /// [`WatchError::Shutdown`] once the tower is being dropped. An
    /// existing-but-unwatchable target (permissions) is *not* an error
    /// here: the registration is returned in a degraded state and the
    /// refusal is available from [`Registration::install_error`].
    pub fn register(
        &self,
        path: impl Into<PathBuf>,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<Registration, WatchError> {
        self.register_arc(path.into(), Arc::new(callback))
    }

    fn register_arc(
        &self,
        path: PathBuf,
        callback: Arc<dyn Fn() + Send + Sync>,
    ) -> Result<Registration, WatchError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.shutdown {
            return Err(WatchError::Shutdown);
        }
        if state.worker == Some(thread::current().id()) {
            panic!("WatchTower::register must not be called from a change callback");
        }

        let mut install_error = None;
        if !state.items.contains_key(&path) {
            let resolution =
                resolve::resolve(&path, inner.config.max_link_depth).map_err(|err| match err {
                    ResolveError::LinkCycle(limit) => WatchError::LinkCycle {
                        path: path.clone(),
                        limit,
                    },
                    ResolveError::NoAncestor(p) => WatchError::Io(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no existing ancestor directory for {}", p.display()),
                    )),
                })?;

            let mut item = WatchedItem::new(path.clone());
            match apply_resolution(&mut state, inner.source.as_ref(), &mut item, &resolution) {
                Ok(outcome) => {
                    if matches!(outcome.degraded, Some(SourceError::Exhausted)) {
                        rollback(&mut state, inner.source.as_ref(), &item);
                        return Err(WatchError::Exhausted);
                    }
                    install_error = outcome.degraded.map(WatchError::from);
                }
                Err(err) => {
                    rollback(&mut state, inner.source.as_ref(), &item);
                    return Err(err);
                }
            }
            debug!(
                path = %path.display(),
                present = item.target.is_some(),
                links = item.links.len(),
                "watching new path"
            );
            state.items.insert(path.clone(), item);
        }

        let id = state.next_subscriber;
        state.next_subscriber += 1;
        let alive = Arc::new(());
        if let Some(item) = state.items.get_mut(&path) {
            item.subscribers.push(Subscriber {
                id,
                callback,
                alive: Arc::downgrade(&alive),
            });
        }
        drop(state);
        inner.source.wake();

        Ok(Registration {
            tower: Arc::downgrade(inner),
            path,
            id,
            install_error,
            _alive: alive,
        })
    }
}

impl Drop for WatchTower {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
        }
        self.inner.source.wake();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("watcher worker panicked during shutdown");
            }
        }
        info!("watch tower stopped");
    }
}

impl std::fmt::Debug for WatchTower {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WatchTower")
            .field("paths", &state.items.len())
            .field("watches", &state.handle_refs.len())
            .finish_non_exhaustive()
    }
}

/// Scoped subscriber token returned by [`WatchTower::register`].
///
/// Dropping the registration withdraws the watch: once `drop` returns, the
/// callback will never run again. The handle holds only a weak link to its
/// registry, so dropping it after the [`WatchTower`] itself has been
/// destroyed is a safe no-op.
#[derive(Debug)]
pub struct Registration {
    tower: Weak<TowerInner>,
    path: PathBuf,
    id: u64,
    install_error: Option<WatchError>,
    _alive: Arc<()>,
}

impl Registration {
    /// The path this registration watches, as registered.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The error, if any, that prevented a watch on the (existing) target
    /// at registration time.
    ///
    /// A registration with an install error is degraded, not dead: the
    /// ancestor directory is still watched and the target is re-tried
    /// whenever it changes (e.g. a `chmod` that makes it readable).
    #[must_use]
    pub fn install_error(&self) -> Option<&WatchError> {
        self.install_error.as_ref()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(inner) = self.tower.upgrade() {
            inner.unregister(&self.path, self.id);
        }
    }
}

/// Outcome of (re)binding an item against a fresh resolution.
pub(crate) struct BindOutcome {
    /// The target's identity or existence changed.
    pub changed: bool,
    /// The target exists but could not be watched.
    pub degraded: Option<SourceError>,
}

/// Installs a file watch, reference-counting the returned handle.
fn acquire_file(
    state: &mut TowerState,
    source: &dyn ChangeSource,
    path: &Path,
) -> Result<WatchHandle, SourceError> {
    let handle = source.add_file(path)?;
    *state.handle_refs.entry(handle).or_insert(0) += 1;
    Ok(handle)
}

/// Installs a directory watch, reference-counting the returned handle.
fn acquire_dir(
    state: &mut TowerState,
    source: &dyn ChangeSource,
    path: &Path,
) -> Result<WatchHandle, SourceError> {
    let handle = source.add_dir(path)?;
    *state.handle_refs.entry(handle).or_insert(0) += 1;
    Ok(handle)
}

/// Lets go of one reference to `handle`, uninstalling the watch when the
/// last reference drops.
pub(crate) fn release_handle(
    state: &mut TowerState,
    source: &dyn ChangeSource,
    handle: WatchHandle,
) {
    match state.handle_refs.get_mut(&handle) {
        Some(count) if *count > 1 => *count -= 1,
        Some(_) => {
            state.handle_refs.remove(&handle);
            source.remove(handle);
        }
        None => {}
    }
}

/// Releases everything a partially-bound item holds.
fn rollback(state: &mut TowerState, source: &dyn ChangeSource, item: &WatchedItem) {
    let handles: SmallVec<[WatchHandle; 4]> = item.handles().collect();
    for handle in handles {
        release_handle(state, source, handle);
    }
}

/// Adjusts `item`'s installed watches to match `resolution`, retaining
/// handles that still refer to the same object so rapid changes do not
/// cause a rewatch storm.
///
/// # Errors
///
/// Only a failure to install the directory watch is an error; it leaves the
/// item without its reappearance anchor and the caller must drop the item
/// after a final notification.
pub(crate) fn apply_resolution(
    state: &mut TowerState,
    source: &dyn ChangeSource,
    item: &mut WatchedItem,
    resolution: &Resolution,
) -> Result<BindOutcome, WatchError> {
    let old_identity = item.identity();
    let mut degraded = None;

    // Directory watch first: install the new anchor before dropping the
    // old one so no reappearance window goes unobserved.
    let dir_moved = match item.dir.as_ref() {
        Some(dir) => dir.path != resolution.deepest_dir,
        None => true,
    };
    if dir_moved {
        let handle = acquire_dir(state, source, &resolution.deepest_dir).map_err(WatchError::from)?;
        if let Some(old) = item.dir.take() {
            release_handle(state, source, old.handle);
        }
        item.dir = Some(DirWatch {
            path: resolution.deepest_dir.clone(),
            handle,
            names: SmallVec::new(),
        });
    }

    // Refresh the entry names of interest: the component whose appearance
    // can change what the path refers to, plus any chain link living in
    // the watched directory.
    let mut names: SmallVec<[std::ffi::OsString; 2]> = SmallVec::new();
    if let Some(pivot) = resolve::pivot_name(resolution) {
        names.push(pivot);
    }
    for link in &resolution.links {
        if link.parent() == Some(resolution.deepest_dir.as_path()) {
            if let Some(base) = link.file_name() {
                if !names.iter().any(|n| n == base) {
                    names.push(base.to_os_string());
                }
            }
        }
    }
    if let Some(dir) = item.dir.as_mut() {
        dir.names = names;
    }

    // Link watches: keep those still in the chain, release the rest,
    // install the new ones.
    let mut kept: SmallVec<[LinkWatch; 2]> = SmallVec::new();
    for link in std::mem::take(&mut item.links) {
        if resolution.links.contains(&link.path) {
            kept.push(link);
        } else {
            release_handle(state, source, link.handle);
        }
    }
    for path in &resolution.links {
        if kept.iter().any(|l| &l.path == path) {
            continue;
        }
        match acquire_file(state, source, path) {
            Ok(handle) => kept.push(LinkWatch {
                path: path.clone(),
                handle,
            }),
            Err(err) => {
                // The directory watch still covers replacement of the
                // link, so a miss here only costs latency.
                debug!(link = %path.display(), error = %err, "could not watch chain link");
            }
        }
    }
    item.links = kept;

    // Target watch: retained when the identity is unchanged.
    let same_object = match (item.identity(), resolution.identity) {
        (Some(old), Some(new)) => old == new,
        (None, None) => true,
        _ => false,
    };
    if same_object {
        if let Some(target) = item.target.as_mut() {
            target.path.clone_from(&resolution.target);
        }
    } else {
        if let Some(old) = item.target.take() {
            release_handle(state, source, old.handle);
        }
        if let Some(identity) = resolution.identity {
            match acquire_file(state, source, &resolution.target) {
                Ok(handle) => {
                    item.target = Some(TargetWatch {
                        path: resolution.target.clone(),
                        handle,
                        identity,
                    });
                }
                Err(SourceError::NotFound(_)) => {
                    // Deleted between resolution and install; the next
                    // directory event rebinds.
                }
                Err(err) => {
                    warn!(
                        path = %resolution.target.display(),
                        error = %err,
                        "target exists but cannot be watched"
                    );
                    degraded = Some(err);
                }
            }
        }
    }

    Ok(BindOutcome {
        changed: old_identity != item.identity(),
        degraded,
    })
}

/// Re-resolves `key` and adjusts its watches.
///
/// A link cycle that appears after registration degrades the item to
/// watching the registered name itself instead of failing it.
///
/// # Errors
///
/// When the item cannot keep any reappearance anchor it is removed from
/// the registry and its subscribers are handed back so the caller can give
/// them one final notification.
pub(crate) fn rebind(
    state: &mut TowerState,
    inner: &TowerInner,
    key: &Path,
) -> Result<BindOutcome, Vec<Subscriber>> {
    let Some(mut item) = state.items.remove(key) else {
        return Ok(BindOutcome {
            changed: false,
            degraded: None,
        });
    };

    let resolution = match resolve::resolve(&item.path, inner.config.max_link_depth) {
        Ok(resolution) => Some(resolution),
        Err(ResolveError::LinkCycle(_)) => {
            warn!(
                path = %item.path.display(),
                "symbolic link chain cycled; watching the registered name itself"
            );
            resolve::deepest_existing_dir(&item.path)
                .ok()
                .map(|deepest_dir| Resolution {
                    links: Vec::new(),
                    target: item.path.clone(),
                    identity: None,
                    deepest_dir,
                })
        }
        Err(ResolveError::NoAncestor(_)) => None,
    };

    let outcome = match resolution {
        Some(resolution) => apply_resolution(state, inner.source.as_ref(), &mut item, &resolution),
        None => Err(WatchError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            "no existing ancestor directory",
        ))),
    };

    match outcome {
        Ok(outcome) => {
            state.items.insert(key.to_path_buf(), item);
            Ok(outcome)
        }
        Err(err) => {
            warn!(
                path = %item.path.display(),
                error = %err,
                "cannot keep watching path; notifying subscribers and dropping it"
            );
            rollback(state, inner.source.as_ref(), &item);
            Err(std::mem::take(&mut item.subscribers))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::mock::{MockSource, WatchKind};
    use crate::source::{RawEvent, RawEventKind};
    use std::fs;
    use std::sync::{Condvar as StdCondvar, Mutex as StdMutex};
    use std::time::Duration;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(2);
    const SETTLE: Duration = Duration::from_millis(100);

    /// Mutex+condvar notification counter, the classic watcher-test
    /// fixture: callbacks bump the count, tests wait for a threshold.
    #[derive(Clone)]
    struct Counter(Arc<(StdMutex<u32>, StdCondvar)>);

    impl Counter {
        fn new() -> Self {
            Self(Arc::new((StdMutex::new(0), StdCondvar::new())))
        }

        fn callback(&self) -> impl Fn() + Send + Sync + 'static {
            let cell = Arc::clone(&self.0);
            move || {
                let (count, condvar) = &*cell;
                *count.lock().unwrap() += 1;
                condvar.notify_all();
            }
        }

        /// Waits until at least `n` notifications arrived, then resets.
        fn wait_for(&self, n: u32, timeout: Duration) -> bool {
            let (count, condvar) = &*self.0;
            let guard = count.lock().unwrap();
            let (mut guard, result) = condvar
                .wait_timeout_while(guard, timeout, |current| *current < n)
                .unwrap();
            let reached = !result.timed_out();
            *guard = 0;
            reached
        }

        fn count(&self) -> u32 {
            *self.0 .0.lock().unwrap()
        }
    }

    fn tower_with_mock() -> (WatchTower, Arc<MockSource>) {
        let mock = Arc::new(MockSource::new());
        let tower = WatchTower::with_source(Arc::clone(&mock) as Arc<dyn ChangeSource>)
            .expect("spawn tower");
        (tower, mock)
    }

    fn sorted(mut watches: Vec<(PathBuf, WatchKind)>) -> Vec<(PathBuf, WatchKind)> {
        watches.sort();
        watches
    }

    #[test]
    fn test_accepts_an_existing_file_to_watch() {
        let dir = TempDir::new().expect("create temp dir");
        let file = dir.path().join("a.log");
        fs::write(&file, "").expect("create file");

        let (tower, _mock) = tower_with_mock();
        let registration = tower.register(&file, || {}).expect("register");
        assert!(registration.install_error().is_none());
        assert_eq!(registration.path(), file.as_path());
    }

    #[test]
    fn test_accepts_a_nonexisting_file_to_watch() {
        let dir = TempDir::new().expect("create temp dir");
        let missing = dir.path().join("not-yet.log");

        let (tower, mock) = tower_with_mock();
        let _registration = tower.register(&missing, || {}).expect("register");
        // Only the ancestor directory is watched.
        assert_eq!(
            mock.installed(),
            vec![(dir.path().to_path_buf(), WatchKind::Dir)]
        );
    }

    #[test]
    fn test_installed_watches_match_registrations() {
        let dir = TempDir::new().expect("create temp dir");
        let present = dir.path().join("present.log");
        let missing = dir.path().join("missing.log");
        fs::write(&present, "").expect("create file");

        let (tower, mock) = tower_with_mock();
        let reg_present = tower.register(&present, || {}).expect("register present");
        let reg_missing = tower.register(&missing, || {}).expect("register missing");

        let expected = sorted(vec![
            (present.clone(), WatchKind::File),
            (dir.path().to_path_buf(), WatchKind::Dir),
        ]);
        assert_eq!(sorted(mock.installed()), expected);

        // Dropping the missing-path registration must not disturb the
        // shared directory watch.
        drop(reg_missing);
        std::thread::sleep(SETTLE);
        assert_eq!(sorted(mock.installed()), expected);

        drop(reg_present);
        std::thread::sleep(SETTLE);
        assert!(mock.installed().is_empty(), "no orphan watches remain");
    }

    #[test]
    fn test_symlink_chain_watches_every_component() {
        let dir = TempDir::new().expect("create temp dir");
        let target = dir.path().join("target.log");
        let link = dir.path().join("link.log");
        fs::write(&target, "").expect("create target");
        std::os::unix::fs::symlink(&target, &link).expect("create link");

        let (tower, mock) = tower_with_mock();
        let registration = tower.register(&link, || {}).expect("register");

        let expected = sorted(vec![
            (link.clone(), WatchKind::File),
            (target.clone(), WatchKind::File),
            (dir.path().to_path_buf(), WatchKind::Dir),
        ]);
        assert_eq!(sorted(mock.installed()), expected);

        drop(registration);
        std::thread::sleep(SETTLE);
        assert!(mock.installed().is_empty());
    }

    #[test]
    fn test_duplicate_registration_installs_no_extra_watches() {
        let dir = TempDir::new().expect("create temp dir");
        let file = dir.path().join("a.log");
        fs::write(&file, "").expect("create file");

        let (tower, mock) = tower_with_mock();
        let first = tower.register(&file, || {}).expect("first");
        let count = mock.watch_count();
        let second = tower.register(&file, || {}).expect("second");
        assert_eq!(mock.watch_count(), count);

        // The item survives as long as one subscriber remains.
        drop(first);
        std::thread::sleep(SETTLE);
        assert_eq!(mock.watch_count(), count);

        drop(second);
        std::thread::sleep(SETTLE);
        assert_eq!(mock.watch_count(), 0);
    }

    #[test]
    fn test_modification_notifies_every_subscriber() {
        let dir = TempDir::new().expect("create temp dir");
        let file = dir.path().join("a.log");
        fs::write(&file, "").expect("create file");

        let (tower, mock) = tower_with_mock();
        let counter = Counter::new();
        let _first = tower.register(&file, counter.callback()).expect("first");
        let _second = tower.register(&file, counter.callback()).expect("second");

        let handle = mock.handle_for(&file).expect("target handle");
        mock.inject(vec![RawEvent::on(handle, RawEventKind::Modified)]);

        assert!(counter.wait_for(2, WAIT), "both subscribers notified");
    }

    #[test]
    fn test_events_in_one_cycle_collapse_into_one_dispatch() {
        let dir = TempDir::new().expect("create temp dir");
        let file = dir.path().join("a.log");
        fs::write(&file, "").expect("create file");

        let (tower, mock) = tower_with_mock();
        let counter = Counter::new();
        let _registration = tower.register(&file, counter.callback()).expect("register");

        let target = mock.handle_for(&file).expect("target handle");
        let dir_handle = mock.handle_for(dir.path()).expect("dir handle");
        fs::remove_file(&file).expect("delete file");
        mock.inject(vec![
            RawEvent::on(target, RawEventKind::AttribChanged),
            RawEvent::on(target, RawEventKind::Removed),
            RawEvent::entry(dir_handle, RawEventKind::EntryDeleted, "a.log"),
        ]);

        assert!(counter.wait_for(1, WAIT));
        std::thread::sleep(SETTLE);
        assert_eq!(counter.count(), 0, "a single dispatch for the whole cycle");
    }

    #[test]
    fn test_released_subscriber_is_never_called() {
        let dir = TempDir::new().expect("create temp dir");
        let file = dir.path().join("a.log");
        fs::write(&file, "").expect("create file");

        let (tower, mock) = tower_with_mock();
        let counter = Counter::new();
        let registration = tower.register(&file, counter.callback()).expect("register");

        let handle = mock.handle_for(&file).expect("target handle");
        mock.inject(vec![RawEvent::on(handle, RawEventKind::Modified)]);
        assert!(counter.wait_for(1, WAIT));

        drop(registration);
        mock.inject(vec![RawEvent::on(handle, RawEventKind::Modified)]);
        assert!(!counter.wait_for(1, Duration::from_millis(200)));
    }

    #[test]
    fn test_removing_one_of_two_watches_still_notifies_the_other() {
        let dir = TempDir::new().expect("create temp dir");
        let file = dir.path().join("a.log");
        fs::write(&file, "").expect("create file");

        let (tower, mock) = tower_with_mock();
        let counter = Counter::new();
        let keep = tower.register(&file, counter.callback()).expect("keep");
        let released = tower.register(&file, counter.callback()).expect("released");
        drop(released);

        let handle = mock.handle_for(&file).expect("target handle");
        mock.inject(vec![RawEvent::on(handle, RawEventKind::Modified)]);

        assert!(counter.wait_for(1, WAIT));
        std::thread::sleep(SETTLE);
        assert_eq!(counter.count(), 0, "exactly one notification");
        drop(keep);
    }

    #[test]
    fn test_nonexistent_path_notifies_on_first_appearance() {
        let dir = TempDir::new().expect("create temp dir");
        let file = dir.path().join("later.log");

        let (tower, mock) = tower_with_mock();
        let counter = Counter::new();
        let _registration = tower.register(&file, counter.callback()).expect("register");

        let dir_handle = mock.handle_for(dir.path()).expect("dir handle");
        fs::write(&file, "now").expect("create file");
        mock.inject(vec![RawEvent::entry(
            dir_handle,
            RawEventKind::EntryCreated,
            "later.log",
        )]);
        assert!(counter.wait_for(1, WAIT), "appearance notifies");

        // Existence changes keep being delivered afterwards.
        let target = mock.handle_for(&file).expect("target now watched");
        fs::remove_file(&file).expect("delete file");
        mock.inject(vec![RawEvent::on(target, RawEventKind::Removed)]);
        assert!(counter.wait_for(1, WAIT), "disappearance notifies");
    }

    #[test]
    fn test_rename_out_and_in_each_notify_once() {
        let dir = TempDir::new().expect("create temp dir");
        let file = dir.path().join("a.log");
        fs::write(&file, "").expect("create file");

        let (tower, mock) = tower_with_mock();
        let counter = Counter::new();
        let _registration = tower.register(&file, counter.callback()).expect("register");
        let dir_handle = mock.handle_for(dir.path()).expect("dir handle");

        let parked = dir.path().join("a2.log");
        fs::rename(&file, &parked).expect("rename away");
        mock.inject(vec![RawEvent::rename(
            dir_handle,
            RawEventKind::RenamedFrom,
            "a.log",
            7,
        )]);
        assert!(counter.wait_for(1, WAIT), "rename away notifies");

        fs::rename(&parked, &file).expect("rename back");
        mock.inject(vec![RawEvent::rename(
            dir_handle,
            RawEventKind::RenamedTo,
            "a.log",
            8,
        )]);
        assert!(counter.wait_for(1, WAIT), "rename into the watched name notifies");
    }

    #[test]
    fn test_overflow_resynchronizes_by_reresolution() {
        let dir = TempDir::new().expect("create temp dir");
        let file = dir.path().join("a.log");
        fs::write(&file, "").expect("create file");

        let (tower, mock) = tower_with_mock();
        let counter = Counter::new();
        let _registration = tower.register(&file, counter.callback()).expect("register");

        // Replace the file behind the watcher's back, then only report an
        // overflow.
        fs::remove_file(&file).expect("delete");
        fs::write(&file, "replacement").expect("recreate");
        mock.inject(vec![RawEvent::overflow()]);

        assert!(counter.wait_for(1, WAIT), "identity change detected");

        // A quiet overflow does not notify.
        mock.inject(vec![RawEvent::overflow()]);
        assert!(!counter.wait_for(1, Duration::from_millis(200)));
    }

    #[test]
    fn test_fatal_source_failure_notifies_once_and_stops() {
        let dir = TempDir::new().expect("create temp dir");
        let file = dir.path().join("a.log");
        fs::write(&file, "").expect("create file");

        let (tower, mock) = tower_with_mock();
        let counter = Counter::new();
        let registration = tower.register(&file, counter.callback()).expect("register");

        mock.fail_next_poll(SourceError::Io(io::Error::other("kernel went away")));

        assert!(counter.wait_for(1, WAIT), "synthetic final notification");
        // Releasing afterwards is safe and quiet.
        drop(registration);
        drop(tower);
    }

    #[test]
    fn test_registration_can_outlive_the_tower() {
        let dir = TempDir::new().expect("create temp dir");
        let file = dir.path().join("a.log");
        fs::write(&file, "").expect("create file");

        let (tower, mock) = tower_with_mock();
        let counter = Counter::new();
        let registration = tower.register(&file, counter.callback()).expect("register");

        drop(tower);
        assert_eq!(counter.count(), 0, "teardown does not dispatch");

        // The tower is gone; releasing must be a harmless no-op.
        drop(registration);
        drop(mock);
    }

    #[test]
    fn test_link_cycle_is_surfaced_at_registration() {
        let dir = TempDir::new().expect("create temp dir");
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::os::unix::fs::symlink(&a, &b).expect("b -> a");
        std::os::unix::fs::symlink(&b, &a).expect("a -> b");

        let (tower, mock) = tower_with_mock();
        let err = tower.register(&a, || {}).expect_err("cycle must fail");
        assert!(matches!(err, WatchError::LinkCycle { .. }));
        assert!(mock.installed().is_empty(), "nothing left installed");
    }
}
