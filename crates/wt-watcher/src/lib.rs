//! Multiplexing file-change notifier.
//!
//! This crate watches an arbitrary number of filesystem paths over a small
//! number of kernel watch handles and invokes a callback whenever a watched
//! path's observable contents or existence change. It is built for the
//! needs of log-tailing viewers: watched files frequently do not exist yet,
//! are rotated, replaced via atomic rename, or reached through chains of
//! symbolic links.
//!
//! # Overview
//!
//! - [`WatchTower`] is the registry. [`WatchTower::register`] takes a path
//!   and a callback and returns a scoped [`Registration`]; dropping the
//!   registration withdraws the watch.
//! - Registering a path that does not exist succeeds: the nearest existing
//!   ancestor directory is watched and the callback fires when the path
//!   appears.
//! - Every symbolic link between the registered path and its final target
//!   is watched individually, so retargeting any link in the chain is
//!   detected.
//! - Callbacks carry no payload. The core reports *that* something changed;
//!   consumers re-examine the file themselves.
//!
//! # Architecture
//!
//! ```text
//! caller threads                         worker thread
//! ──────────────                         ─────────────
//! register/drop ──► registry (mutex) ◄── poll → classify → rebind
//!                        │                         │
//!                        ▼                         ▼
//!                  ChangeSource  ──────────► callbacks (no lock held)
//!                  (kernel watches)
//! ```
//!
//! The [`ChangeSource`] trait is the only platform-specific seam; the
//! bundled [`InotifySource`] implements it for Linux.
//!
//! # Usage
//!
//! ```no_run
//! use wt_watcher::WatchTower;
//!
//! # fn main() -> Result<(), wt_watcher::WatchError> {
//! let tower = WatchTower::new()?;
//! let registration = tower.register("/var/log/app.log", || {
//!     println!("log changed, re-read it");
//! })?;
//!
//! // ... the callback fires on the worker thread until `registration`
//! // is dropped ...
//! drop(registration);
//! # Ok(())
//! # }
//! ```
//!
//! Async consumers can use [`ChangeStream`] instead of a raw callback:
//!
//! ```no_run
//! use wt_watcher::WatchTower;
//!
//! # async fn example() -> Result<(), wt_watcher::WatchError> {
//! let tower = WatchTower::new()?;
//! let mut stream = tower.stream("/var/log/app.log")?;
//! while stream.changed().await.is_some() {
//!     // re-read the file
//! }
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod error;
pub mod source;
pub mod stream;

mod item;
mod registry;
mod resolve;
mod worker;

pub use error::WatchError;
pub use registry::{Registration, WatchTower};
pub use source::{ChangeSource, RawEvent, RawEventKind, SourceError, WatchHandle};
pub use stream::ChangeStream;

#[cfg(target_os = "linux")]
pub use source::linux::InotifySource;
