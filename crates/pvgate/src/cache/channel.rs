// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One upstream channel, shared by name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::admin::counters::{CountGuard, InstanceClass};
use crate::gateway::{DownstreamChannel, Error, Result};
use crate::listener::MonitorRequester;
use crate::monitor::{MonitorEntry, MonitorUser};
use crate::request::RequestSignature;
use crate::upstream::{ChannelListener, ChannelState, UpstreamChannel, UpstreamProvider};

/// One upstream channel by name: connection state machine, deduplicated
/// monitor map and the set of downstream channels keeping it open.
///
/// The cache owns the entry; downstream wrappers and monitor subscribers
/// hold it through `Arc`s handed out by the cache. Back-references from the
/// monitor layer are `Weak`.
pub struct ChannelEntry {
    name: String,
    state: Mutex<ChannelState>,
    upstream: Mutex<Option<Arc<dyn UpstreamChannel>>>,
    /// Upstream subscriptions keyed by normalized request. At most one
    /// entry per signature.
    monitors: Mutex<HashMap<RequestSignature, Arc<MonitorEntry>>>,
    /// Downstream channel wrappers holding this entry open.
    interested: Mutex<Vec<Weak<DownstreamChannel>>>,
    /// Grace flag: external interest sets it, the sweeper consumes it.
    drop_poke: AtomicBool,
    _count: CountGuard,
}

impl ChannelEntry {
    pub(crate) fn new(name: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(ChannelState::Init),
            upstream: Mutex::new(None),
            monitors: Mutex::new(HashMap::new()),
            interested: Mutex::new(Vec::new()),
            // creation is external interest
            drop_poke: AtomicBool::new(true),
            _count: CountGuard::new(InstanceClass::ChannelEntry),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection_state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    /// Restart the eviction grace window.
    pub fn poke(&self) {
        self.drop_poke.store(true, Ordering::Relaxed);
    }

    /// Consume the grace flag; used only by the sweeper.
    pub(crate) fn take_poke(&self) -> bool {
        self.drop_poke.swap(false, Ordering::Relaxed)
    }

    /// Launch the upstream connection. Completion arrives asynchronously
    /// through `channel_state_change`; a failed launch leaves the entry in
    /// the cache, disconnected, for the transport to retry.
    pub(crate) fn start_connect(self: &Arc<Self>, provider: &Arc<dyn UpstreamProvider>) {
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *st != ChannelState::Init {
                return;
            }
            *st = ChannelState::Connecting;
        }
        let listener: Arc<dyn ChannelListener> = Arc::clone(self) as Arc<dyn ChannelListener>;
        match provider.connect(&self.name, listener) {
            Ok(handle) => {
                *self.upstream.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
            }
            Err(e) => {
                log::warn!("[CHANNEL] connect launch failed for '{}': {}", self.name, e);
                let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if *st == ChannelState::Connecting {
                    *st = ChannelState::Disconnected;
                }
            }
        }
    }

    /// Attach a downstream subscription, creating the deduplicated upstream
    /// monitor on first use of its signature.
    pub fn attach_monitor(
        self: &Arc<Self>,
        signature: &RequestSignature,
        requester: Arc<dyn MonitorRequester>,
    ) -> Result<Arc<MonitorUser>> {
        if self.connection_state() == ChannelState::Destroyed {
            return Err(Error::InvalidState(format!(
                "channel '{}' is destroyed",
                self.name
            )));
        }

        let (entry, created) = {
            let mut monitors = self.monitors.lock().unwrap_or_else(|e| e.into_inner());
            match monitors.get(signature) {
                Some(existing) if !existing.is_done() => (Arc::clone(existing), false),
                _ => {
                    let entry = MonitorEntry::new(Arc::downgrade(self), signature.clone());
                    monitors.insert(signature.clone(), Arc::clone(&entry));
                    (entry, true)
                }
            }
        };

        let user = entry.attach(requester);

        if created {
            log::debug!(
                "[CHANNEL] new upstream monitor on '{}' ({} now)",
                self.name,
                self.monitor_count()
            );
            if self.is_connected() {
                if let Some(channel) = self.upstream_handle() {
                    entry.issue(&channel);
                }
            }
        }
        Ok(user)
    }

    /// Remove a downstream subscription from whichever monitor holds it.
    /// The emptied monitor is retained until the next cache sweep.
    pub fn detach_monitor(&self, user: &MonitorUser) {
        for entry in self.monitor_entries() {
            if entry.detach(user) {
                break;
            }
        }
    }

    /// Register a downstream channel wrapper holding this entry open.
    pub(crate) fn add_interested(&self, channel: &Arc<DownstreamChannel>) {
        let mut interested = self.interested.lock().unwrap_or_else(|e| e.into_inner());
        interested.retain(|w| w.strong_count() > 0);
        interested.push(Arc::downgrade(channel));
    }

    /// Downstream channels currently holding this entry open.
    pub fn interested_count(&self) -> usize {
        let mut interested = self.interested.lock().unwrap_or_else(|e| e.into_inner());
        interested.retain(|w| w.strong_count() > 0);
        interested.len()
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Attached downstream subscriptions across all monitors.
    pub fn subscriber_count(&self) -> usize {
        let monitors = self.monitors.lock().unwrap_or_else(|e| e.into_inner());
        monitors.values().map(|m| m.user_count()).sum()
    }

    /// Whether anything outside the cache still refers to this entry.
    pub(crate) fn has_external_refs(&self) -> bool {
        if self.interested_count() > 0 {
            return true;
        }
        let monitors = self.monitors.lock().unwrap_or_else(|e| e.into_inner());
        monitors.values().any(|m| m.user_count() > 0)
    }

    /// Sever ownership: tear down monitors and the upstream connection.
    /// Idempotent; the entry is unusable afterwards.
    pub(crate) fn destroy(&self) {
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *st == ChannelState::Destroyed {
                return;
            }
            *st = ChannelState::Destroyed;
        }
        let monitors = {
            let mut map = self.monitors.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *map)
        };
        for entry in monitors.values() {
            entry.shutdown();
        }
        let handle = self.upstream.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.destroy();
        }
        log::info!("[CHANNEL] '{}' destroyed", self.name);
    }

    fn upstream_handle(&self) -> Option<Arc<dyn UpstreamChannel>> {
        self.upstream.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn monitor_entries(&self) -> Vec<Arc<MonitorEntry>> {
        let monitors = self.monitors.lock().unwrap_or_else(|e| e.into_inner());
        monitors.values().cloned().collect()
    }

    fn interested_channels(&self) -> Vec<Arc<DownstreamChannel>> {
        let mut interested = self.interested.lock().unwrap_or_else(|e| e.into_inner());
        interested.retain(|w| w.strong_count() > 0);
        interested.iter().filter_map(Weak::upgrade).collect()
    }
}

impl ChannelListener for ChannelEntry {
    fn channel_state_change(&self, state: ChannelState) {
        let previous = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *st == ChannelState::Destroyed || *st == state {
                return;
            }
            let previous = *st;
            *st = state;
            previous
        };
        log::info!("[CHANNEL] '{}' {} -> {}", self.name, previous, state);

        if state == ChannelState::Connected {
            // a successful connect restarts the grace window
            self.poke();
        }

        for channel in self.interested_channels() {
            channel.notify_state(state);
        }

        let monitors = self.monitor_entries();
        match state {
            ChannelState::Connected => {
                if let Some(handle) = self.upstream_handle() {
                    for entry in &monitors {
                        entry.on_channel_connected(&handle);
                    }
                }
            }
            ChannelState::Disconnected => {
                for entry in &monitors {
                    entry.on_channel_disconnected();
                }
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for ChannelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEntry")
            .field("name", &self.name)
            .field("state", &self.connection_state())
            .field("monitors", &self.monitor_count())
            .field("interested", &self.interested_count())
            .finish()
    }
}
