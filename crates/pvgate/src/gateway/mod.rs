// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Gateway facade
//!
//! The public surface of the gateway core: name resolution, downstream
//! channel creation and monitor attachment, backed by the shared
//! [`ChannelCache`](crate::cache::ChannelCache).
//!
//! ## Overview
//!
//! ```text
//! downstream client
//!   channel_find(name) ----> rewrite ----> cache lookup / background create
//!   create_channel(name) --> rewrite ----> connected entry -> DownstreamChannel
//!   create_monitor(chan) --> signature --> ChannelEntry::attach_monitor
//! ```
//!
//! A [`DownstreamChannel`] holds its [`ChannelEntry`] alive; cancelling all
//! downstream objects for a name lets the sweeper reclaim the upstream
//! connection after one grace round.


use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::admin::counters::{CountGuard, InstanceClass};
use crate::admin::{ChannelView, GatewayStatus};
use crate::cache::{ChannelCache, ChannelEntry};
use crate::config::GatewayConfig;
use crate::listener::{ChannelRequester, MonitorRequester};
use crate::monitor::MonitorUser;
use crate::pvdata::PvStructure;
use crate::request::RequestSignature;
use crate::upstream::{ChannelState, UpstreamProvider};

// =======================================================================
// Errors
// =======================================================================

/// Errors surfaced by the gateway core.
///
/// Queue overflow is deliberately absent: overflow is signaled through
/// overrun bits on deliveries, never as a failure.
#[derive(Debug)]
pub enum Error {
    /// Name not resolvable to a connected upstream channel.
    NotFound(String),
    /// Upstream connectivity lost; subscriptions are retained.
    Disconnected,
    /// Upstream structure shape changed mid-subscription.
    TypeMismatch,
    /// Upstream terminally unlistened the subscription.
    Terminal,
    /// Malformed request; the create call fails synchronously.
    ProtocolError(String),
    /// Operation not legal in the current lifecycle state.
    InvalidState(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(name) => write!(f, "channel not found: '{}'", name),
            Error::Disconnected => write!(f, "upstream disconnected"),
            Error::TypeMismatch => write!(f, "upstream type changed"),
            Error::Terminal => write!(f, "upstream unlistened"),
            Error::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            Error::InvalidState(msg) => write!(f, "invalid state: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

/// Convenient alias for results using the gateway [`Error`].
pub type Result<T> = core::result::Result<T, Error>;

// =======================================================================
// Downstream channel wrapper
// =======================================================================

/// A downstream client's view of one gateway channel.
///
/// Holds the underlying [`ChannelEntry`] alive and owns (jointly with the
/// fan-out) the subscriptions created through it; closing the channel
/// cancels them.
pub struct DownstreamChannel {
    /// Client-facing name, before any rewrite.
    name: String,
    entry: Arc<ChannelEntry>,
    requester: Arc<dyn ChannelRequester>,
    users: Mutex<Vec<Arc<MonitorUser>>>,
    closed: AtomicBool,
    _count: CountGuard,
}

impl DownstreamChannel {
    fn new(
        name: String,
        entry: Arc<ChannelEntry>,
        requester: Arc<dyn ChannelRequester>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            entry,
            requester,
            users: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            _count: CountGuard::new(InstanceClass::DownstreamChannel),
        })
    }

    /// The name the client asked for (pre-rewrite).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shared upstream entry backing this channel.
    pub fn entry(&self) -> &Arc<ChannelEntry> {
        &self.entry
    }

    pub fn is_connected(&self) -> bool {
        self.entry.is_connected()
    }

    /// Cancel every subscription created through this channel. Idempotent;
    /// also runs on drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let users = {
            let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *users)
        };
        for user in users {
            user.cancel();
        }
    }

    pub(crate) fn notify_state(&self, state: ChannelState) {
        if !self.closed.load(Ordering::Acquire) {
            self.requester.channel_state_change(state);
        }
    }

    fn track_user(&self, user: &Arc<MonitorUser>) {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        users.retain(|u| !u.is_dead());
        users.push(Arc::clone(user));
    }
}

impl Drop for DownstreamChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for DownstreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownstreamChannel")
            .field("name", &self.name)
            .field("target", &self.entry.name())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

// =======================================================================
// Provider
// =======================================================================

struct Sweeper {
    handle: JoinHandle<()>,
    stop: Arc<(Mutex<bool>, Condvar)>,
}

/// The gateway's downstream-facing provider.
///
/// Resolves names (with optional prefix rewriting), hands out
/// [`DownstreamChannel`]s for connected entries and attaches monitor
/// subscriptions. `start`/`stop` control the cache eviction sweeper.
pub struct GatewayProvider {
    cache: Arc<ChannelCache>,
    config: GatewayConfig,
    sweeper: Mutex<Option<Sweeper>>,
}

impl GatewayProvider {
    pub fn new(upstream: Arc<dyn UpstreamProvider>, config: GatewayConfig) -> Self {
        Self {
            cache: Arc::new(ChannelCache::new(upstream)),
            config,
            sweeper: Mutex::new(None),
        }
    }

    /// The underlying cache; exposed for embedding hosts and tests.
    pub fn cache(&self) -> &Arc<ChannelCache> {
        &self.cache
    }

    /// Answer a search request.
    ///
    /// Returns true only when a connected entry exists. A miss starts (or
    /// keeps alive) background resolution so a retrying client eventually
    /// gets a hit.
    pub fn channel_find(&self, name: &str) -> bool {
        let target = self.config.rewrite(name);
        match self.cache.lookup(&target) {
            None => {
                // first request: create the entry, answer once connected
                self.cache.get(&target);
                log::debug!("[GATEWAY] search miss for '{}', resolving '{}'", name, target);
                false
            }
            Some(entry) if entry.is_connected() => {
                log::info!("[GATEWAY] accepting '{}' as '{}'", name, target);
                true
            }
            Some(_) => {
                // not connected yet, but a client is still interested
                log::debug!("[GATEWAY] cache poke '{}'", target);
                false
            }
        }
    }

    /// Create a downstream channel for `name`.
    ///
    /// Requires a connected cache entry; anything else is `NotFound` with no
    /// side effect beyond restarting the entry's grace window.
    pub fn create_channel(
        &self,
        name: &str,
        requester: Arc<dyn ChannelRequester>,
    ) -> Result<Arc<DownstreamChannel>> {
        let target = self.config.rewrite(name);
        let entry = match self.cache.lookup(&target) {
            Some(entry) if entry.is_connected() => entry,
            _ => {
                log::info!("[GATEWAY] refusing channel '{}'", name);
                return Err(Error::NotFound(name.to_string()));
            }
        };
        log::info!("[GATEWAY] connecting channel '{}' as '{}'", name, target);
        let channel = DownstreamChannel::new(name.to_string(), entry, requester);
        channel.entry.add_interested(&channel);
        Ok(channel)
    }

    /// Attach a monitor subscription on a downstream channel.
    ///
    /// The request structure is normalized into a [`RequestSignature`];
    /// identical signatures share one upstream subscription.
    pub fn create_monitor(
        &self,
        channel: &Arc<DownstreamChannel>,
        request: &PvStructure,
        requester: Arc<dyn MonitorRequester>,
    ) -> Result<Arc<MonitorUser>> {
        let signature = RequestSignature::from_request(request)?;
        let user = channel.entry.attach_monitor(&signature, requester)?;
        channel.track_user(&user);
        Ok(user)
    }

    /// Start the cache sweeper. Idempotent.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if sweeper.is_some() {
            log::info!("[GATEWAY] already started");
            return;
        }
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let period = Duration::from_millis(self.config.sweep_period_ms.max(1));
        let cache = Arc::clone(&self.cache);
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("pvgate-sweep".into())
            .spawn(move || {
                let (lock, condvar) = &*thread_stop;
                let mut stopped = lock.lock().unwrap_or_else(|e| e.into_inner());
                while !*stopped {
                    let (guard, timeout) = condvar
                        .wait_timeout(stopped, period)
                        .unwrap_or_else(|e| e.into_inner());
                    stopped = guard;
                    if *stopped {
                        break;
                    }
                    if timeout.timed_out() {
                        cache.sweep();
                    }
                }
            })
            .expect("sweeper thread spawn must succeed");
        *sweeper = Some(Sweeper { handle, stop });
        log::info!(
            "[GATEWAY] started (sweep period {} ms)",
            self.config.sweep_period_ms
        );
    }

    /// Stop the cache sweeper and wait for it to exit. No-op when not
    /// running.
    pub fn stop(&self) {
        let sweeper = {
            let mut slot = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        let Some(Sweeper { handle, stop }) = sweeper else {
            log::info!("[GATEWAY] not running");
            return;
        };
        {
            let (lock, condvar) = &*stop;
            let mut stopped = lock.lock().unwrap_or_else(|e| e.into_inner());
            *stopped = true;
            condvar.notify_all();
        }
        if handle.join().is_err() {
            log::warn!("[GATEWAY] sweeper thread panicked");
        }
        log::info!("[GATEWAY] stopped");
    }

    /// Point-in-time status report. Level 0 reports counts; level >= 1 adds
    /// per-channel connection state and subscriber counts.
    pub fn status(&self, level: u32) -> GatewayStatus {
        let channel_count = self.cache.len();
        let channels = if level >= 1 {
            self.cache
                .entries_snapshot()
                .iter()
                .map(|entry| ChannelView {
                    name: entry.name().to_string(),
                    state: entry.connection_state(),
                    interested: entry.interested_count(),
                    monitors: entry.monitor_count(),
                    subscribers: entry.subscriber_count(),
                })
                .collect()
        } else {
            Vec::new()
        };
        GatewayStatus {
            channel_count,
            channels,
        }
    }
}

impl Drop for GatewayProvider {
    fn drop(&mut self) {
        self.stop();
        self.cache.clear();
    }
}

impl fmt::Debug for GatewayProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayProvider")
            .field("channels", &self.cache.len())
            .finish()
    }
}
