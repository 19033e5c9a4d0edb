// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One upstream subscription and its fan-out list.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use super::MonitorUser;
use crate::admin::counters::{CountGuard, InstanceClass};
use crate::cache::ChannelEntry;
use crate::listener::MonitorRequester;
use crate::pvdata::{BitSet, PvStructure, StructDef};
use crate::request::RequestSignature;
use crate::upstream::{ChannelState, MonitorSink, UpstreamChannel, UpstreamMonitor};

struct EntryState {
    /// Current upstream type descriptor.
    dtype: Option<Arc<StructDef>>,
    /// Latest merged full value seen from upstream.
    snapshot: Option<PvStructure>,
    /// Attached subscribers. Order is stable (attach order).
    users: Vec<Arc<MonitorUser>>,
    connected: bool,
    /// Upstream sent its terminal `unlisten`.
    done: bool,
    upstream: Option<Arc<dyn UpstreamMonitor>>,
}

/// One deduplicated upstream subscription.
///
/// At most one entry exists per (channel, signature); every downstream
/// subscriber with that signature attaches here. The entry merges upstream
/// deltas into its snapshot and offers each event to every attached
/// [`MonitorUser`] under its own queue/credit rules.
pub struct MonitorEntry {
    channel: Weak<ChannelEntry>,
    signature: RequestSignature,
    state: Mutex<EntryState>,
    _count: CountGuard,
}

impl MonitorEntry {
    pub(crate) fn new(channel: Weak<ChannelEntry>, signature: RequestSignature) -> Arc<Self> {
        Arc::new(Self {
            channel,
            signature,
            state: Mutex::new(EntryState {
                dtype: None,
                snapshot: None,
                users: Vec::new(),
                connected: false,
                done: false,
                upstream: None,
            }),
            _count: CountGuard::new(InstanceClass::MonitorEntry),
        })
    }

    pub fn signature(&self) -> &RequestSignature {
        &self.signature
    }

    pub fn user_count(&self) -> usize {
        self.state.lock().users.len()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state.lock().done
    }

    fn channel_name(&self) -> String {
        self.channel
            .upgrade()
            .map(|c| c.name().to_string())
            .unwrap_or_default()
    }

    /// Attach a new subscriber. When the upstream is already connected the
    /// subscriber is announced the current type and offered a synthesized
    /// initial (whole value, no overrun).
    pub(crate) fn attach(
        self: &Arc<Self>,
        requester: Arc<dyn MonitorRequester>,
    ) -> Arc<MonitorUser> {
        let user = MonitorUser::new(Arc::downgrade(self), &self.signature, requester);
        let mut announce: Option<(Arc<dyn MonitorRequester>, Arc<StructDef>)> = None;
        let mut wake: Option<Arc<dyn MonitorRequester>> = None;
        {
            let mut st = self.state.lock();
            st.users.push(Arc::clone(&user));
            if st.connected {
                if let (Some(dtype), Some(snapshot)) = (st.dtype.clone(), st.snapshot.as_ref()) {
                    if user.mark_type_seen() {
                        announce = Some((user.requester_arc(), dtype));
                    }
                    wake = user.accept_connect(snapshot);
                }
            }
        }
        if let Some((requester, dtype)) = announce {
            requester.monitor_connect(dtype);
        }
        if let Some(requester) = wake {
            requester.monitor_event();
        }
        user
    }

    /// Remove a subscriber from the fan-out. The entry itself is retained
    /// (even when empty) until the next cache sweep decides its fate.
    pub(crate) fn detach(&self, user: &MonitorUser) -> bool {
        let mut st = self.state.lock();
        let before = st.users.len();
        st.users
            .retain(|u| !std::ptr::eq(Arc::as_ptr(u), user as *const MonitorUser));
        before != st.users.len()
    }

    /// Issue (or re-issue) the upstream subscription on a connected channel.
    pub(crate) fn issue(self: &Arc<Self>, channel: &Arc<dyn UpstreamChannel>) {
        if self.is_done() {
            return;
        }
        let sink: Arc<dyn MonitorSink> = Arc::clone(self) as Arc<dyn MonitorSink>;
        match channel.create_monitor(&self.signature, sink) {
            Ok(handle) => {
                self.state.lock().upstream = Some(handle);
            }
            Err(e) => {
                log::warn!(
                    "[MONITOR] upstream monitor create failed for '{}': {}",
                    channel.name(),
                    e
                );
            }
        }
    }

    /// Channel reconnected: re-issue the subscription and tell subscribers.
    pub(crate) fn on_channel_connected(self: &Arc<Self>, channel: &Arc<dyn UpstreamChannel>) {
        let requesters: Vec<_> = {
            let st = self.state.lock();
            if st.done {
                return;
            }
            st.users.iter().map(|u| u.requester_arc()).collect()
        };
        for r in requesters {
            r.channel_state_change(ChannelState::Connected);
        }
        self.issue(channel);
    }

    /// Channel lost: keep subscribers attached, surface the state event.
    pub(crate) fn on_channel_disconnected(&self) {
        let requesters: Vec<_> = {
            let mut st = self.state.lock();
            st.connected = false;
            st.upstream = None;
            st.users.iter().map(|u| u.requester_arc()).collect()
        };
        for r in requesters {
            r.channel_state_change(ChannelState::Disconnected);
        }
    }

    /// Deliver a pending coalesced update into a freed slot or freshly
    /// granted credit. Called from the subscriber with no locks held.
    pub(crate) fn refill(&self, user: &MonitorUser) {
        let wake = {
            let st = self.state.lock();
            match st.snapshot.as_ref() {
                Some(snapshot) => user.flush(snapshot),
                None => None,
            }
        };
        if let Some(requester) = wake {
            requester.monitor_event();
        }
    }

    /// Forced teardown at cache clear/eviction: destroy the upstream handle
    /// and terminally unlisten any remaining subscribers.
    pub(crate) fn shutdown(&self) {
        let (upstream, users) = {
            let mut st = self.state.lock();
            st.done = true;
            st.connected = false;
            (st.upstream.take(), std::mem::take(&mut st.users))
        };
        if let Some(handle) = upstream {
            handle.destroy();
        }
        for user in users {
            user.terminate();
        }
    }
}

impl MonitorSink for MonitorEntry {
    fn monitor_connect(&self, dtype: Arc<StructDef>, initial: &PvStructure) {
        let mut announcements: Vec<(Arc<dyn MonitorRequester>, Arc<StructDef>)> = Vec::new();
        let mut wakes: Vec<Arc<dyn MonitorRequester>> = Vec::new();
        {
            let mut st = self.state.lock();
            if st.done {
                return;
            }
            let type_changed = match &st.dtype {
                Some(previous) => **previous != *dtype,
                None => false,
            };
            if type_changed {
                log::info!(
                    "[MONITOR] type change on '{}', re-announcing to {} subscribers",
                    self.channel_name(),
                    st.users.len()
                );
            }
            st.dtype = Some(Arc::clone(&dtype));
            st.snapshot = Some(initial.clone());
            st.connected = true;

            let EntryState { snapshot, users, .. } = &mut *st;
            if let Some(snapshot) = snapshot.as_ref() {
                for user in users.iter() {
                    if type_changed {
                        user.reset_type_seen();
                    }
                    if user.mark_type_seen() {
                        announcements.push((user.requester_arc(), Arc::clone(&dtype)));
                    }
                    if let Some(wake) = user.accept_connect(snapshot) {
                        wakes.push(wake);
                    }
                }
            }
        }
        for (requester, dtype) in announcements {
            requester.monitor_connect(dtype);
        }
        for requester in wakes {
            requester.monitor_event();
        }
    }

    fn monitor_event(&self, delta: &PvStructure, changed: &BitSet, overrun: &BitSet) {
        let mut wakes: Vec<Arc<dyn MonitorRequester>> = Vec::new();
        {
            let mut st = self.state.lock();
            if st.done || !st.connected {
                return;
            }
            match st.snapshot.as_mut() {
                Some(snapshot) => snapshot.merge_from(delta, changed),
                None => st.snapshot = Some(delta.clone()),
            }
            let EntryState { snapshot, users, .. } = &mut *st;
            if let Some(snapshot) = snapshot.as_ref() {
                for user in users.iter() {
                    if let Some(wake) = user.offer(snapshot, changed, overrun) {
                        wakes.push(wake);
                    }
                }
            }
        }
        for requester in wakes {
            requester.monitor_event();
        }
    }

    fn unlisten(&self) {
        let users = {
            let mut st = self.state.lock();
            if st.done {
                return;
            }
            st.done = true;
            st.connected = false;
            st.upstream = None;
            std::mem::take(&mut st.users)
        };
        log::debug!(
            "[MONITOR] upstream unlisten on '{}', detaching {} subscribers",
            self.channel_name(),
            users.len()
        );
        for user in users {
            user.terminate();
        }
    }
}

impl std::fmt::Debug for MonitorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("MonitorEntry")
            .field("signature", &self.signature)
            .field("users", &st.users.len())
            .field("connected", &st.connected)
            .field("done", &st.done)
            .finish()
    }
}
