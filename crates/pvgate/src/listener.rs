// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Downstream listener traits.
//!
//! The gateway notifies its downstream side (the server transport, or a test
//! harness) through these callbacks. They are the counterpart of the
//! transport-facing sinks in [`crate::upstream`].
//!
//! # Thread safety
//!
//! Callbacks are invoked from upstream transport threads and from whichever
//! thread mutates a subscription, but **never with a core lock held**: wake
//! notifications are collected under the locks and delivered after release.
//! Implementations must be `Send + Sync` and must not block.

use std::sync::Arc;

use crate::pvdata::StructDef;
use crate::upstream::ChannelState;

/// Callbacks for one downstream channel.
pub trait ChannelRequester: Send + Sync {
    /// Upstream connectivity of the channel changed.
    fn channel_state_change(&self, state: ChannelState);
}

/// Callbacks for one downstream subscription.
///
/// `monitor_event` is a wake, not a delivery: the subscriber drains data by
/// calling [`MonitorUser::poll`](crate::monitor::MonitorUser::poll).
pub trait MonitorRequester: Send + Sync {
    /// The subscription's type descriptor is (re)established. Delivered
    /// before the synthesized initial element on first connect and after a
    /// type change.
    fn monitor_connect(&self, dtype: Arc<StructDef>);

    /// The subscription's queue went from empty to non-empty.
    fn monitor_event(&self);

    /// Upstream connectivity changed; no data accompanies this.
    fn channel_state_change(&self, state: ChannelState);

    /// Terminal: no further events will be delivered.
    fn unlisten(&self);
}

/// No-op requester for callers that only ever poll.
pub struct NullMonitorRequester;

impl MonitorRequester for NullMonitorRequester {
    fn monitor_connect(&self, _dtype: Arc<StructDef>) {}
    fn monitor_event(&self) {}
    fn channel_state_change(&self, _state: ChannelState) {}
    fn unlisten(&self) {}
}

/// No-op channel requester.
pub struct NullChannelRequester;

impl ChannelRequester for NullChannelRequester {
    fn channel_state_change(&self, _state: ChannelState) {}
}
