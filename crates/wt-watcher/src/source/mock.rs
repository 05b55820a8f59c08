//! Scripted in-process change source for tests.
//!
//! Records every install and removal so property tests can compare the
//! installed watch set against the set the registry should imply, and
//! replays injected event batches through `poll()`.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use super::{ChangeSource, RawEvent, SourceError, WatchHandle};

/// Whether a watch was installed for a filesystem object or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum WatchKind {
    File,
    Dir,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    installed: Vec<(WatchHandle, PathBuf, WatchKind)>,
    queue: VecDeque<Vec<RawEvent>>,
    woken: bool,
    poll_failure: Option<SourceError>,
}

/// A [`ChangeSource`] that never touches the kernel.
///
/// Installs are deduplicated by `(path, kind)`, mimicking inotify's
/// per-inode deduplication closely enough for registry tests.
pub(crate) struct MockSource {
    state: Mutex<MockState>,
    available: Condvar,
}

impl MockSource {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_handle: 1,
                ..MockState::default()
            }),
            available: Condvar::new(),
        }
    }

    /// Queues a batch of events for the next `poll()`.
    pub(crate) fn inject(&self, events: Vec<RawEvent>) {
        let mut state = self.lock();
        state.queue.push_back(events);
        self.available.notify_all();
    }

    /// Makes the next `poll()` fail, simulating a dying kernel source.
    pub(crate) fn fail_next_poll(&self, err: SourceError) {
        let mut state = self.lock();
        state.poll_failure = Some(err);
        self.available.notify_all();
    }

    /// Returns the handle currently installed for `path`, if any.
    pub(crate) fn handle_for(&self, path: &Path) -> Option<WatchHandle> {
        let state = self.lock();
        state
            .installed
            .iter()
            .find(|(_, p, _)| p == path)
            .map(|(h, _, _)| *h)
    }

    /// Returns the installed watch set as `(path, kind)` pairs.
    pub(crate) fn installed(&self) -> Vec<(PathBuf, WatchKind)> {
        let state = self.lock();
        state
            .installed
            .iter()
            .map(|(_, p, k)| (p.clone(), *k))
            .collect()
    }

    /// Number of installed watches.
    pub(crate) fn watch_count(&self) -> usize {
        self.lock().installed.len()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn install(&self, path: &Path, kind: WatchKind) -> Result<WatchHandle, SourceError> {
        let mut state = self.lock();
        if let Some((handle, _, _)) = state
            .installed
            .iter()
            .find(|(_, p, k)| p == path && *k == kind)
        {
            return Ok(*handle);
        }
        let handle = WatchHandle::from_raw(state.next_handle);
        state.next_handle += 1;
        state.installed.push((handle, path.to_path_buf(), kind));
        Ok(handle)
    }
}

impl ChangeSource for MockSource {
    fn add_file(&self, path: &Path) -> Result<WatchHandle, SourceError> {
        self.install(path, WatchKind::File)
    }

    fn add_dir(&self, path: &Path) -> Result<WatchHandle, SourceError> {
        self.install(path, WatchKind::Dir)
    }

    fn remove(&self, handle: WatchHandle) {
        let mut state = self.lock();
        state.installed.retain(|(h, _, _)| *h != handle);
    }

    fn poll(&self) -> Result<Vec<RawEvent>, SourceError> {
        let mut state = self.lock();
        loop {
            if let Some(err) = state.poll_failure.take() {
                return Err(err);
            }
            if let Some(batch) = state.queue.pop_front() {
                return Ok(batch);
            }
            if state.woken {
                state.woken = false;
                return Ok(Vec::new());
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn wake(&self) {
        let mut state = self.lock();
        state.woken = true;
        self.available.notify_all();
    }
}
