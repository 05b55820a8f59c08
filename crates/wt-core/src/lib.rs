//! Core types, errors, and configuration for the WatchTower workspace.
//!
//! This crate provides the foundation shared by the watcher crates:
//!
//! - [`ObjectIdentity`] - the `(device, inode)` identity of a filesystem object
//! - [`WatchConfig`] - watcher tuning knobs with serde support
//! - [`ConfigError`] - configuration loading and validation errors
//! - Type aliases for `FxHashMap`/`FxHashSet` (faster than std)

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod identity;

pub use config::WatchConfig;
pub use error::ConfigError;
pub use identity::ObjectIdentity;

/// A `HashMap` using the fast, non-cryptographic `FxHash` hasher.
///
/// Watch registries are keyed by small values (paths, opaque handles) that
/// are hashed on every kernel event, so hashing speed matters more than
/// DoS resistance here.
pub type FxHashMap<K, V> = rustc_hash::FxHashMap<K, V>;

/// A `HashSet` using the fast, non-cryptographic `FxHash` hasher.
pub type FxHashSet<T> = rustc_hash::FxHashSet<T>;

/// Creates an [`FxHashMap`] with at least the given capacity.
#[must_use]
pub fn fx_hash_map_with_capacity<K, V>(capacity: usize) -> FxHashMap<K, V> {
    FxHashMap::with_capacity_and_hasher(capacity, rustc_hash::FxBuildHasher)
}
