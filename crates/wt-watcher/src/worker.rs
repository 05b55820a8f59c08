//! The event loop.
//!
//! One thread per registry: poll the change source, classify each raw
//! event against the items that hold the producing watch, rebind where the
//! filesystem shape changed, then invoke callbacks with the registry lock
//! released. Events that land on the same item within one poll cycle
//! collapse into a single dispatch; dispatch order across items follows
//! event arrival order.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use smallvec::SmallVec;
use tracing::{debug, error, info, trace, warn};

use crate::item::{Subscriber, WatchRole};
use crate::registry::{self, TowerInner, TowerState};
use crate::source::{RawEvent, RawEventKind};

type Callback = (Arc<dyn Fn() + Send + Sync>, Weak<()>);

/// A planned dispatch: either every current subscriber of an item, looked
/// up after all mutations commit, or a direct snapshot for an item that no
/// longer exists (its final notification).
enum Pending {
    Item(PathBuf),
    Direct(Vec<Callback>),
}

pub(crate) fn run(inner: Arc<TowerInner>) {
    inner.state.lock().worker = Some(std::thread::current().id());
    info!("watcher worker started");

    loop {
        let events = match inner.source.poll() {
            Ok(events) => events,
            Err(err) => {
                error!(error = %err, "change source failed; stopping watcher");
                fatal_shutdown(&inner);
                return;
            }
        };

        let mut state = inner.state.lock();
        if state.shutdown {
            debug!(discarded = events.len(), "worker stopping");
            info!("watcher worker stopped");
            return;
        }
        if events.is_empty() {
            // Woken so a registration change is observed on the next poll.
            continue;
        }

        let batch = classify_batch(&mut state, &inner, &events);
        if batch.is_empty() {
            continue;
        }

        state.dispatching = true;
        drop(state);
        dispatch(&batch);
        inner.state.lock().dispatching = false;
        inner.dispatch_done.notify_all();
    }
}

fn dispatch(batch: &[Callback]) {
    for (callback, alive) in batch {
        // The liveness probe covers owners that died between the snapshot
        // and this call.
        if alive.upgrade().is_some() {
            callback();
        }
    }
}

/// The change source is gone for good: notify every live subscriber once
/// so nobody waits forever on a change that can no longer be observed,
/// then shut the registry down.
fn fatal_shutdown(inner: &Arc<TowerInner>) {
    let mut state = inner.state.lock();
    if state.shutdown {
        return;
    }
    state.shutdown = true;
    let batch: Vec<Callback> = state
        .items
        .values()
        .flat_map(|item| item.subscribers.iter().map(snapshot_one))
        .collect();
    state.items.clear();
    state.handle_refs.clear();
    state.dispatching = true;
    drop(state);

    dispatch(&batch);

    inner.state.lock().dispatching = false;
    inner.dispatch_done.notify_all();
    info!("watcher worker stopped");
}

fn snapshot_one(subscriber: &Subscriber) -> Callback {
    (subscriber.callback.clone(), subscriber.alive.clone())
}

fn snapshot(subscribers: &[Subscriber]) -> Vec<Callback> {
    subscribers.iter().map(snapshot_one).collect()
}

fn mark(pending: &mut Vec<Pending>, key: PathBuf) {
    let seen = pending
        .iter()
        .any(|p| matches!(p, Pending::Item(k) if *k == key));
    if !seen {
        pending.push(Pending::Item(key));
    }
}

fn classify_batch(
    state: &mut TowerState,
    inner: &TowerInner,
    events: &[RawEvent],
) -> Vec<Callback> {
    let mut pending: Vec<Pending> = Vec::new();

    for event in events {
        trace!(handle = %event.handle, kind = ?event.kind, name = ?event.name, "raw event");

        if event.kind == RawEventKind::Overflow {
            warn!("kernel event queue overflowed; re-resolving every watched path");
            let keys: Vec<PathBuf> = state.items.keys().cloned().collect();
            for key in keys {
                match registry::rebind(state, inner, &key) {
                    Ok(outcome) => {
                        if outcome.changed {
                            mark(&mut pending, key);
                        }
                    }
                    Err(subscribers) => pending.push(Pending::Direct(snapshot(&subscribers))),
                }
            }
            continue;
        }

        let keys: SmallVec<[PathBuf; 2]> = state
            .items
            .iter()
            .filter(|(_, item)| item.uses_handle(event.handle))
            .map(|(key, _)| key.clone())
            .collect();

        for key in keys {
            let Some(role) = state.items.get(&key).and_then(|i| i.role_of(event.handle)) else {
                continue;
            };
            match (role, event.kind) {
                // An observable change to the file itself.
                (WatchRole::Target, RawEventKind::Modified | RawEventKind::AttribChanged) => {
                    mark(&mut pending, key);
                }

                // The inode lost its last name. Keep the directory watch:
                // it is what notices a reappearance.
                (WatchRole::Target, RawEventKind::Removed) => {
                    let taken = state
                        .items
                        .get_mut(&key)
                        .and_then(|item| item.target.take());
                    if let Some(target) = taken {
                        registry::release_handle(state, inner.source.as_ref(), target.handle);
                    }
                    mark(&mut pending, key);
                }

                // Renamed away from the watched name.
                (WatchRole::Target, RawEventKind::RenamedSelf) => {
                    match registry::rebind(state, inner, &key) {
                        Ok(_) => mark(&mut pending, key),
                        Err(subscribers) => pending.push(Pending::Direct(snapshot(&subscribers))),
                    }
                }

                // Something happened to a watched name in the anchor
                // directory: reappearance, disappearance, or rename.
                (WatchRole::Dir, kind) if kind.is_entry_event() => {
                    let Some(name) = event.name.as_deref() else {
                        continue;
                    };
                    let matches = state
                        .items
                        .get(&key)
                        .is_some_and(|item| item.matches_entry(name));
                    if !matches {
                        continue;
                    }
                    let had_target = state
                        .items
                        .get(&key)
                        .is_some_and(|item| item.target.is_some());
                    match registry::rebind(state, inner, &key) {
                        Ok(outcome) => {
                            let name_left = matches!(
                                kind,
                                RawEventKind::EntryDeleted | RawEventKind::RenamedFrom
                            );
                            if outcome.changed || (name_left && had_target) {
                                mark(&mut pending, key);
                            }
                        }
                        Err(subscribers) => pending.push(Pending::Direct(snapshot(&subscribers))),
                    }
                }

                // A link in the chain was retargeted or removed.
                (
                    WatchRole::Link,
                    RawEventKind::Removed | RawEventKind::RenamedSelf | RawEventKind::Modified,
                ) => match registry::rebind(state, inner, &key) {
                    Ok(outcome) => {
                        if outcome.changed {
                            mark(&mut pending, key);
                        }
                    }
                    Err(subscribers) => pending.push(Pending::Direct(snapshot(&subscribers))),
                },

                // Attribute noise on directories and links is not an
                // observable change to the watched file.
                _ => {}
            }
        }
    }

    let mut batch = Vec::new();
    for entry in pending {
        match entry {
            Pending::Item(key) => {
                if let Some(item) = state.items.get(&key) {
                    batch.extend(item.subscribers.iter().map(snapshot_one));
                }
            }
            Pending::Direct(callbacks) => batch.extend(callbacks),
        }
    }
    batch
}
