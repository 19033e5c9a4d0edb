// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport-facing traits.
//!
//! The gateway core is transport-agnostic: the wire codec and the TCP/UDP
//! machinery live behind [`UpstreamProvider`], and everything the transport
//! tells the core arrives through the sink traits here. The abstract
//! operations are:
//!
//! | operation | direction | carried by |
//! |---|---|---|
//! | `connect(name)` | core -> transport | [`UpstreamProvider::connect`] |
//! | `monitorCreate(signature)` | core -> transport | [`UpstreamChannel::create_monitor`] |
//! | `channelStateChange(state)` | transport -> core | [`ChannelListener::channel_state_change`] |
//! | `monitorConnect(type, initial)` | transport -> core | [`MonitorSink::monitor_connect`] |
//! | `monitorEvent(delta, changed, overrun)` | transport -> core | [`MonitorSink::monitor_event`] |
//! | `unlisten` | transport -> core | [`MonitorSink::unlisten`] |
//!
//! # Thread safety
//!
//! Sink callbacks are invoked from transport threads and are serialized per
//! upstream channel. Implementations must be `Send + Sync`. The core never
//! calls into the transport while holding one of its locks.

use std::fmt;
use std::sync::Arc;

use crate::gateway::Result;
use crate::pvdata::{BitSet, PvStructure, StructDef};
use crate::request::RequestSignature;

/// Connection lifecycle of an upstream channel.
///
/// ```text
/// INIT -> CONNECTING -> CONNECTED <-> DISCONNECTED -> DESTROYED
/// ```
///
/// Only `Connected` permits upstream monitor creation; in `Disconnected`
/// existing subscriptions are preserved and re-issued on reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Init,
    Connecting,
    Connected,
    Disconnected,
    Destroyed,
}

impl ChannelState {
    pub fn is_connected(self) -> bool {
        self == ChannelState::Connected
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Init => "INIT",
            ChannelState::Connecting => "CONNECTING",
            ChannelState::Connected => "CONNECTED",
            ChannelState::Disconnected => "DISCONNECTED",
            ChannelState::Destroyed => "DESTROYED",
        };
        f.write_str(name)
    }
}

/// Factory for upstream channels; implemented by the client-side transport.
pub trait UpstreamProvider: Send + Sync {
    /// Begin resolving `name`. Returns a handle immediately; connection
    /// completes asynchronously via `listener.channel_state_change`.
    fn connect(
        &self,
        name: &str,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<Arc<dyn UpstreamChannel>>;
}

/// One upstream channel as seen by the core.
pub trait UpstreamChannel: Send + Sync {
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Issue an upstream subscription. Legal only while connected; the sink
    /// receives the type descriptor and initial value, then a stream of
    /// events, serialized by the transport.
    fn create_monitor(
        &self,
        signature: &RequestSignature,
        sink: Arc<dyn MonitorSink>,
    ) -> Result<Arc<dyn UpstreamMonitor>>;

    /// Tear the channel down. No callbacks after this returns.
    fn destroy(&self);
}

/// Handle for one upstream subscription.
pub trait UpstreamMonitor: Send + Sync {
    /// Cancel the subscription. No sink callbacks after this returns.
    fn destroy(&self);
}

/// Transport -> core channel lifecycle callbacks.
pub trait ChannelListener: Send + Sync {
    fn channel_state_change(&self, state: ChannelState);
}

/// Transport -> core subscription callbacks.
pub trait MonitorSink: Send + Sync {
    /// Subscription established (or re-established): the current type
    /// descriptor and a full initial value.
    fn monitor_connect(&self, dtype: Arc<StructDef>, initial: &PvStructure);

    /// One upstream update: a delta payload plus the changed/overrun bitsets
    /// describing it.
    fn monitor_event(&self, delta: &PvStructure, changed: &BitSet, overrun: &BitSet);

    /// Terminal: the upstream will produce no further events.
    fn unlisten(&self);
}
