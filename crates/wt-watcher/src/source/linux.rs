//! Linux change source backed by inotify.
//!
//! A single inotify instance carries every watch. `poll()` blocks in
//! `poll(2)` on the inotify descriptor and a self-pipe; `wake()` writes a
//! byte to the pipe, which is how registration paths interrupt a blocked
//! worker. Watch descriptors are mapped to crate-level [`WatchHandle`]s so
//! the rest of the crate never sees kernel descriptors.

use std::ffi::OsStr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use parking_lot::Mutex;
use tracing::trace;

use wt_core::{fx_hash_map_with_capacity, FxHashMap};

use super::{ChangeSource, RawEvent, RawEventKind, SourceError, WatchHandle};

/// Events a watch on a filesystem object must report.
fn file_mask() -> WatchMask {
    WatchMask::MODIFY
        | WatchMask::ATTRIB
        | WatchMask::DELETE_SELF
        | WatchMask::MOVE_SELF
        | WatchMask::DONT_FOLLOW
}

/// Events a directory watch must report, per entry.
fn dir_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::ONLYDIR
}

/// The read half of the inotify instance plus its event buffer.
struct Reader {
    inotify: Inotify,
    buffer: Vec<u8>,
}

/// Two-way mapping between kernel watch descriptors and opaque handles.
struct HandleTable {
    by_id: FxHashMap<WatchHandle, WatchDescriptor>,
    by_wd: FxHashMap<WatchDescriptor, WatchHandle>,
}

impl HandleTable {
    fn new() -> Self {
        Self {
            by_id: fx_hash_map_with_capacity(16),
            by_wd: fx_hash_map_with_capacity(16),
        }
    }
}

/// [`ChangeSource`] implementation for Linux.
///
/// Note that inotify watches are per *inode*: installing a watch on two
/// names of the same object yields the same descriptor, and therefore the
/// same [`WatchHandle`]. Callers reference-count handles accordingly.
pub struct InotifySource {
    reader: Mutex<Reader>,
    watches: Mutex<Watches>,
    table: Mutex<HandleTable>,
    next_handle: AtomicU64,
    inotify_fd: RawFd,
    wake_rx: OwnedFd,
    wake_tx: OwnedFd,
}

impl InotifySource {
    /// Creates a source with the given kernel event buffer size.
    ///
    /// # Errors
    ///
    /// Propagates failures from `inotify_init(2)` or `pipe2(2)`.
    pub fn new(buffer_bytes: usize) -> io::Result<Self> {
        let mut inotify = Inotify::init()?;
        let watches = inotify.watches();
        let inotify_fd = inotify.as_raw_fd();

        let mut pipe_fds: [RawFd; 2] = [0; 2];
        // SAFETY: pipe2 fills the two-element array we hand it.
        let rc = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2 succeeded, so both fds are valid and owned by us.
        let (wake_rx, wake_tx) =
            unsafe { (OwnedFd::from_raw_fd(pipe_fds[0]), OwnedFd::from_raw_fd(pipe_fds[1])) };

        Ok(Self {
            reader: Mutex::new(Reader {
                inotify,
                buffer: vec![0u8; buffer_bytes.max(1024)],
            }),
            watches: Mutex::new(watches),
            table: Mutex::new(HandleTable::new()),
            next_handle: AtomicU64::new(1),
            inotify_fd,
            wake_rx,
            wake_tx,
        })
    }

    fn install(&self, path: &Path, mask: WatchMask) -> Result<WatchHandle, SourceError> {
        let added = self.watches.lock().add(path, mask);
        let wd = added.map_err(|err| map_install_error(err, path))?;

        let mut table = self.table.lock();
        if let Some(&existing) = table.by_wd.get(&wd) {
            // Same inode as an earlier install; hand back the same handle.
            return Ok(existing);
        }
        let handle = WatchHandle::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed));
        table.by_id.insert(handle, wd.clone());
        table.by_wd.insert(wd, handle);
        trace!(%handle, path = %path.display(), "installed watch");
        Ok(handle)
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: reading into a local buffer from our own pipe fd.
            let n = unsafe {
                libc::read(self.wake_rx.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl ChangeSource for InotifySource {
    fn add_file(&self, path: &Path) -> Result<WatchHandle, SourceError> {
        self.install(path, file_mask())
    }

    fn add_dir(&self, path: &Path) -> Result<WatchHandle, SourceError> {
        self.install(path, dir_mask())
    }

    fn remove(&self, handle: WatchHandle) {
        let wd = {
            let mut table = self.table.lock();
            match table.by_id.remove(&handle) {
                Some(wd) => {
                    table.by_wd.remove(&wd);
                    wd
                }
                None => return,
            }
        };
        if let Err(err) = self.watches.lock().remove(wd) {
            // EINVAL here means the kernel already dropped the watch
            // (object deleted or unmounted); that removal counts.
            trace!(%handle, error = %err, "watch was already gone");
        }
    }

    fn poll(&self) -> Result<Vec<RawEvent>, SourceError> {
        loop {
            let mut fds = [
                libc::pollfd {
                    fd: self.inotify_fd,
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.wake_rx.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            // SAFETY: fds points at two initialized pollfd records.
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(SourceError::Io(err));
            }

            let woken = fds[1].revents & libc::POLLIN != 0;
            if woken {
                self.drain_wake_pipe();
            }

            let mut out = Vec::new();
            if fds[0].revents & libc::POLLIN != 0 {
                let mut reader = self.reader.lock();
                let Reader { inotify, buffer } = &mut *reader;
                match inotify.read_events(buffer) {
                    Ok(events) => {
                        let mut table = self.table.lock();
                        for event in events {
                            if let Some(raw) = convert(&mut table, &event) {
                                out.push(raw);
                            }
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => return Err(SourceError::Io(err)),
                }
            }

            if woken || !out.is_empty() {
                return Ok(out);
            }
        }
    }

    fn wake(&self) {
        let byte = [1u8];
        // SAFETY: writing one byte from a local buffer to our own pipe fd.
        // EAGAIN means a wake is already pending, which is just as good.
        let _ = unsafe { libc::write(self.wake_tx.as_raw_fd(), byte.as_ptr().cast(), 1) };
    }
}

fn map_install_error(err: io::Error, path: &Path) -> SourceError {
    if err.raw_os_error() == Some(libc::ENOSPC) {
        return SourceError::Exhausted;
    }
    match err.kind() {
        io::ErrorKind::PermissionDenied => SourceError::AccessDenied(path.to_path_buf()),
        io::ErrorKind::NotFound => SourceError::NotFound(path.to_path_buf()),
        _ if err.raw_os_error() == Some(libc::ENOTDIR) => SourceError::NotFound(path.to_path_buf()),
        _ => SourceError::Io(err),
    }
}

fn convert(table: &mut HandleTable, event: &inotify::Event<&OsStr>) -> Option<RawEvent> {
    let mask = event.mask;
    if mask.contains(EventMask::Q_OVERFLOW) {
        return Some(RawEvent::overflow());
    }
    if mask.contains(EventMask::IGNORED) {
        // The kernel retired this watch; forget the mapping so a later
        // remove() for the handle is a no-op.
        if let Some(handle) = table.by_wd.remove(&event.wd) {
            table.by_id.remove(&handle);
            trace!(%handle, "kernel retired watch");
        }
        return None;
    }

    let handle = *table.by_wd.get(&event.wd)?;
    let kind = if mask.contains(EventMask::MODIFY) {
        RawEventKind::Modified
    } else if mask.contains(EventMask::ATTRIB) {
        RawEventKind::AttribChanged
    } else if mask.contains(EventMask::DELETE_SELF) || mask.contains(EventMask::UNMOUNT) {
        RawEventKind::Removed
    } else if mask.contains(EventMask::MOVE_SELF) {
        RawEventKind::RenamedSelf
    } else if mask.contains(EventMask::CREATE) {
        RawEventKind::EntryCreated
    } else if mask.contains(EventMask::DELETE) {
        RawEventKind::EntryDeleted
    } else if mask.contains(EventMask::MOVED_FROM) {
        RawEventKind::RenamedFrom
    } else if mask.contains(EventMask::MOVED_TO) {
        RawEventKind::RenamedTo
    } else {
        return None;
    };

    Some(RawEvent {
        handle,
        kind,
        name: event.name.map(OsStr::to_os_string),
        cookie: (event.cookie != 0).then_some(event.cookie),
    })
}
