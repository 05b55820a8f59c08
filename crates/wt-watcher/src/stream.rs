//! Async change notifications.
//!
//! Bridges the callback-based registry onto tokio: [`WatchTower::stream`]
//! registers a callback that feeds a bounded channel, and
//! [`ChangeStream::changed`] awaits the next notification. Notifications
//! carry no payload, so a full channel loses nothing: a change is already
//! queued and the consumer will re-examine the file anyway.

use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::error::WatchError;
use crate::registry::{Registration, WatchTower};

/// An async stream of change notifications for one registered path.
///
/// Dropping the stream drops its [`Registration`] and withdraws the watch.
///
/// # Examples
///
/// ```no_run
/// use wt_watcher::WatchTower;
///
/// # async fn example() -> Result<(), wt_watcher::WatchError> {
/// let tower = WatchTower::new()?;
/// let mut stream = tower.stream("/var/log/app.log")?;
/// while stream.changed().await.is_some() {
///     // the file changed; re-read it
/// }
/// // `None` means the tower was torn down.
/// # Ok(())
/// # }
/// ```
pub struct ChangeStream {
    rx: mpsc::Receiver<()>,
    registration: Registration,
}

impl WatchTower {
    /// Registers `path` and returns an async stream of its changes.
    ///
    /// The channel capacity comes from
    /// [`WatchConfig::stream_capacity`](wt_core::WatchConfig).
    ///
    /// # Errors
    ///
    /// As for [`WatchTower::register`].
    pub fn stream(&self, path: impl Into<PathBuf>) -> Result<ChangeStream, WatchError> {
        let capacity = self.inner.config.stream_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let registration = self.register(path, move || {
            // try_send: the callback must not block the worker, and a full
            // channel already carries a pending notification.
            let _ = tx.try_send(());
        })?;
        Ok(ChangeStream { rx, registration })
    }
}

impl ChangeStream {
    /// Waits for the next change notification.
    ///
    /// Returns `None` once no further notification can ever arrive, i.e.
    /// after the owning [`WatchTower`] has been destroyed.
    pub async fn changed(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    /// Returns `true` if a change notification is already queued,
    /// consuming it.
    pub fn try_changed(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// The underlying registration.
    #[must_use]
    pub fn registration(&self) -> &Registration {
        &self.registration
    }
}

impl std::fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStream")
            .field("path", &self.registration.path())
            .finish_non_exhaustive()
    }
}
