// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process upstream provider for tests.
//!
//! Named mailbox PVs with `post`/`disconnect`/`reconnect` controls, driving
//! the gateway core through the same traits a real transport would. Events
//! are delivered synchronously on the caller's thread, which the transport
//! contract allows (callbacks are serialized per channel).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::gateway::Result;
use crate::listener::{ChannelRequester, MonitorRequester};
use crate::monitor::{EventGate, MonitorElement, MonitorUser};
use crate::pvdata::{BitSet, PvStructure, ScalarValue, StructDef};
use crate::request::RequestSignature;
use crate::upstream::{
    ChannelListener, ChannelState, MonitorSink, UpstreamChannel, UpstreamMonitor, UpstreamProvider,
};

/// Upstream provider serving a fixed set of mailbox PVs.
pub struct TestProvider {
    pvs: Mutex<HashMap<String, Arc<TestPv>>>,
}

impl TestProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pvs: Mutex::new(HashMap::new()),
        })
    }

    /// Serve a PV under `name` with a default-initialized value.
    pub fn add_pv(self: &Arc<Self>, name: &str, dtype: Arc<StructDef>) -> Arc<TestPv> {
        let pv = Arc::new(TestPv {
            dtype: Mutex::new(Arc::clone(&dtype)),
            value: Mutex::new(PvStructure::new(dtype)),
            online: AtomicBool::new(true),
            channels: Mutex::new(Vec::new()),
        });
        let mut pvs = self.pvs.lock().unwrap_or_else(|e| e.into_inner());
        pvs.insert(name.to_string(), Arc::clone(&pv));
        pv
    }
}

impl UpstreamProvider for TestProvider {
    fn connect(
        &self,
        name: &str,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<Arc<dyn UpstreamChannel>> {
        let pv = {
            let pvs = self.pvs.lock().unwrap_or_else(|e| e.into_inner());
            pvs.get(name).cloned()
        };
        let channel = Arc::new(TestChannel {
            name: name.to_string(),
            pv: pv.clone(),
            listener,
            connected: AtomicBool::new(false),
            monitors: Arc::new(Mutex::new(Vec::new())),
            next_monitor_id: AtomicUsize::new(0),
        });
        if let Some(pv) = pv {
            let mut channels = pv.channels.lock().unwrap_or_else(|e| e.into_inner());
            channels.push(Arc::downgrade(&channel));
            drop(channels);
            if pv.online.load(Ordering::Acquire) {
                channel.connected.store(true, Ordering::Release);
                channel.listener.channel_state_change(ChannelState::Connected);
            }
        }
        // unknown names stay in CONNECTING forever
        Ok(channel)
    }
}

/// One served mailbox PV.
pub struct TestPv {
    dtype: Mutex<Arc<StructDef>>,
    value: Mutex<PvStructure>,
    online: AtomicBool,
    channels: Mutex<Vec<Weak<TestChannel>>>,
}

impl TestPv {
    /// Mutate the current value without posting.
    pub fn put(&self, mutate: impl FnOnce(&mut PvStructure)) {
        let mut value = self.value.lock().unwrap_or_else(|e| e.into_inner());
        mutate(&mut value);
    }

    pub fn put_int(&self, path: &str, v: i32) {
        self.put(|value| {
            assert!(value.set_scalar(path, ScalarValue::Int(v)));
        });
    }

    /// Bit position of a field path in the current descriptor.
    pub fn offset_of(&self, path: &str) -> usize {
        self.dtype
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .offset_of(path)
            .expect("known field path")
    }

    /// Post the current value with the given changed bits (no overrun).
    pub fn post(&self, changed: &BitSet) {
        self.post_with_overrun(changed, &BitSet::new());
    }

    pub fn post_with_overrun(&self, changed: &BitSet, overrun: &BitSet) {
        let value = self
            .value
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for sink in self.live_sinks() {
            sink.monitor_event(&value, changed, overrun);
        }
    }

    /// Drop upstream connectivity; subscriptions must survive.
    pub fn disconnect(&self) {
        self.online.store(false, Ordering::Release);
        for channel in self.live_channels() {
            channel.connected.store(false, Ordering::Release);
            channel
                .monitors
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
            channel.listener.channel_state_change(ChannelState::Disconnected);
        }
    }

    /// Restore connectivity; the core re-issues its subscriptions.
    pub fn reconnect(&self) {
        self.online.store(true, Ordering::Release);
        for channel in self.live_channels() {
            channel.connected.store(true, Ordering::Release);
            channel.listener.channel_state_change(ChannelState::Connected);
        }
    }

    /// Replace the PV's shape mid-subscription, announcing the new type and
    /// a fresh full value to every live subscription.
    pub fn change_type(&self, dtype: Arc<StructDef>, value: PvStructure) {
        {
            let mut current = self.dtype.lock().unwrap_or_else(|e| e.into_inner());
            *current = Arc::clone(&dtype);
        }
        {
            let mut current = self.value.lock().unwrap_or_else(|e| e.into_inner());
            *current = value.clone();
        }
        for sink in self.live_sinks() {
            sink.monitor_connect(Arc::clone(&dtype), &value);
        }
    }

    fn live_channels(&self) -> Vec<Arc<TestChannel>> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.retain(|w| w.strong_count() > 0);
        channels.iter().filter_map(Weak::upgrade).collect()
    }

    fn live_sinks(&self) -> Vec<Arc<dyn MonitorSink>> {
        let mut sinks = Vec::new();
        for channel in self.live_channels() {
            if !channel.connected.load(Ordering::Acquire) {
                continue;
            }
            let monitors = channel.monitors.lock().unwrap_or_else(|e| e.into_inner());
            sinks.extend(monitors.iter().map(|(_, sink)| Arc::clone(sink)));
        }
        sinks
    }
}

type MonitorTable = Arc<Mutex<Vec<(usize, Arc<dyn MonitorSink>)>>>;

struct TestChannel {
    name: String,
    pv: Option<Arc<TestPv>>,
    listener: Arc<dyn ChannelListener>,
    connected: AtomicBool,
    monitors: MonitorTable,
    next_monitor_id: AtomicUsize,
}

impl UpstreamChannel for TestChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn create_monitor(
        &self,
        _signature: &RequestSignature,
        sink: Arc<dyn MonitorSink>,
    ) -> Result<Arc<dyn UpstreamMonitor>> {
        let pv = match (&self.pv, self.is_connected()) {
            (Some(pv), true) => Arc::clone(pv),
            _ => return Err(crate::gateway::Error::Disconnected),
        };
        let id = self.next_monitor_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut monitors = self.monitors.lock().unwrap_or_else(|e| e.into_inner());
            monitors.push((id, Arc::clone(&sink)));
        }
        let dtype = Arc::clone(&pv.dtype.lock().unwrap_or_else(|e| e.into_inner()));
        let value = pv.value.lock().unwrap_or_else(|e| e.into_inner()).clone();
        sink.monitor_connect(dtype, &value);
        Ok(Arc::new(TestMonitorHandle {
            id,
            monitors: Arc::clone(&self.monitors),
        }))
    }

    fn destroy(&self) {
        self.connected.store(false, Ordering::Release);
        self.monitors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

struct TestMonitorHandle {
    id: usize,
    monitors: MonitorTable,
}

impl UpstreamMonitor for TestMonitorHandle {
    fn destroy(&self) {
        let mut monitors = self.monitors.lock().unwrap_or_else(|e| e.into_inner());
        monitors.retain(|(id, _)| *id != self.id);
    }
}

/// Downstream requester recording callbacks and signaling an [`EventGate`].
pub struct GateRequester {
    pub gate: EventGate,
    pub connects: Mutex<Vec<Arc<StructDef>>>,
    pub states: Mutex<Vec<ChannelState>>,
    pub unlistened: AtomicBool,
}

impl GateRequester {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: EventGate::new(),
            connects: Mutex::new(Vec::new()),
            states: Mutex::new(Vec::new()),
            unlistened: AtomicBool::new(false),
        })
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn recorded_states(&self) -> Vec<ChannelState> {
        self.states.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn was_unlistened(&self) -> bool {
        self.unlistened.load(Ordering::Acquire)
    }

    /// Wait for a queue wake, then poll.
    pub fn wait_poll(&self, user: &MonitorUser, timeout: Duration) -> Option<Box<MonitorElement>> {
        if let Some(element) = user.poll() {
            // consume the wake that announced this data
            self.gate.check_and_clear();
            return Some(element);
        }
        if self.gate.wait_timeout(timeout) {
            return user.poll();
        }
        user.poll()
    }
}

/// Channel requester recording connection state transitions.
pub struct StateRecorder {
    states: Mutex<Vec<ChannelState>>,
}

impl StateRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            states: Mutex::new(Vec::new()),
        })
    }

    pub fn recorded(&self) -> Vec<ChannelState> {
        self.states.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ChannelRequester for StateRecorder {
    fn channel_state_change(&self, state: ChannelState) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.push(state);
    }
}

impl MonitorRequester for GateRequester {
    fn monitor_connect(&self, dtype: Arc<StructDef>) {
        let mut connects = self.connects.lock().unwrap_or_else(|e| e.into_inner());
        connects.push(dtype);
    }

    fn monitor_event(&self) {
        self.gate.signal();
    }

    fn channel_state_change(&self, state: ChannelState) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.push(state);
    }

    fn unlisten(&self) {
        self.unlistened.store(true, Ordering::Release);
        self.gate.signal();
    }
}
