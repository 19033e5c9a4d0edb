// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide channel cache.
//!
//! Deduplicates upstream channels by name: any number of downstream
//! subscribers for `y.rec` share one [`ChannelEntry`] and therefore one
//! upstream connection. Exactly one entry exists per name at any time.
//!
//! # Eviction
//!
//! Two-phase mark-and-drop with grace, run by a periodic sweep:
//!
//! 1. An entry whose `drop_poke` flag is set survives the tick (the flag is
//!    consumed). Any external interest sets the flag: creation, a name
//!    lookup, a successful connect.
//! 2. Otherwise, an entry with no external referrers (no downstream channel,
//!    no attached subscriber) is removed from the table and its upstream
//!    connection destroyed.
//!
//! Late-arriving clients of a popular channel therefore never force a
//! reconnect cycle, while unused channels go away within two ticks.
//!
//! Upstream connect failures never remove an entry; it stays cached in a
//! disconnected state and subscribers receive a state event when
//! connectivity returns.

mod channel;

pub use channel::ChannelEntry;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::upstream::UpstreamProvider;

/// Name -> [`ChannelEntry`] table plus the upstream provider used to
/// resolve new names.
pub struct ChannelCache {
    entries: Mutex<HashMap<String, Arc<ChannelEntry>>>,
    provider: Arc<dyn UpstreamProvider>,
}

impl ChannelCache {
    pub fn new(provider: Arc<dyn UpstreamProvider>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            provider,
        }
    }

    /// Return the entry for `name`, creating it and launching its upstream
    /// connection on first use. Idempotent per name; the connect happens
    /// outside the cache lock.
    pub fn get(&self, name: &str) -> Arc<ChannelEntry> {
        let (entry, created) = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.get(name) {
                Some(existing) => {
                    existing.poke();
                    (Arc::clone(existing), false)
                }
                None => {
                    let entry = ChannelEntry::new(name.to_string());
                    entries.insert(name.to_string(), Arc::clone(&entry));
                    (entry, true)
                }
            }
        };
        if created {
            log::info!("[CACHE] new channel entry '{}'", name);
            entry.start_connect(&self.provider);
        }
        entry
    }

    /// Non-creating lookup. A hit restarts the entry's grace window.
    pub fn lookup(&self, name: &str) -> Option<Arc<ChannelEntry>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(name)?;
        entry.poke();
        Some(Arc::clone(entry))
    }

    /// One eviction tick; see the module docs for the two phases.
    pub fn sweep(&self) {
        let doomed = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let mut doomed = Vec::new();
            entries.retain(|name, entry| {
                if entry.take_poke() {
                    return true;
                }
                if entry.has_external_refs() {
                    return true;
                }
                log::info!("[CACHE] dropping idle channel '{}'", name);
                doomed.push(Arc::clone(entry));
                false
            });
            doomed
        };
        // teardown outside the cache lock
        for entry in doomed {
            entry.destroy();
        }
    }

    /// Tear down every entry; used at shutdown.
    pub fn clear(&self) {
        let entries = {
            let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *map)
        };
        if !entries.is_empty() {
            log::info!("[CACHE] clearing {} channel entries", entries.len());
        }
        for entry in entries.into_values() {
            entry.destroy();
        }
    }

    /// Number of cached channels.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of the entry table, for the status surface. The
    /// cache lock is held only while cloning the `Arc`s.
    pub fn entries_snapshot(&self) -> Vec<Arc<ChannelEntry>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = entries.values().cloned().collect();
        out.sort_by(|a, b| a.name().cmp(b.name()));
        out
    }
}

impl std::fmt::Debug for ChannelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCache")
            .field("entries", &self.len())
            .finish()
    }
}
