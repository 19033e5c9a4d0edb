// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # pvgate - process-variable protocol gateway core
//!
//! A gateway for a structured process-variable messaging protocol: it
//! accepts client subscriptions on its downstream side, maintains shared
//! upstream subscriptions toward origin servers, and multiplexes each
//! upstream update stream to many downstream subscribers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pvgate::{GatewayConfig, GatewayProvider};
//! use std::sync::Arc;
//! # fn connect_transport() -> Arc<dyn pvgate::UpstreamProvider> { unimplemented!() }
//! # fn my_channel_requester() -> Arc<dyn pvgate::ChannelRequester> { unimplemented!() }
//! # fn my_monitor_requester() -> Arc<dyn pvgate::MonitorRequester> { unimplemented!() }
//! # fn monitor_request() -> pvgate::PvStructure { unimplemented!() }
//!
//! let gateway = GatewayProvider::new(connect_transport(), GatewayConfig::default());
//! gateway.start();
//!
//! // search / create flow, as driven by the server transport
//! if gateway.channel_find("y.rec") {
//!     let channel = gateway.create_channel("y.rec", my_channel_requester())?;
//!     let monitor = gateway.create_monitor(&channel, &monitor_request(), my_monitor_requester())?;
//!     monitor.start();
//!     while let Some(element) = monitor.poll() {
//!         // consume element.value / element.changed / element.overrun
//!         monitor.release(element);
//!     }
//! }
//! # Ok::<(), pvgate::Error>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        GatewayProvider                             |
//! |   channel_find | create_channel | create_monitor | status          |
//! +--------------------------------------------------------------------+
//! |                         ChannelCache                               |
//! |   name -> ChannelEntry (dedup) | two-phase grace eviction          |
//! +--------------------------------------------------------------------+
//! |                         ChannelEntry                               |
//! |   connection state machine | signature -> MonitorEntry (dedup)     |
//! +--------------------------------------------------------------------+
//! |                  MonitorEntry  ->  N x MonitorUser                 |
//! |   merged snapshot | fan-out | bounded queues | changed/overrun     |
//! +--------------------------------------------------------------------+
//! |                     upstream transport (traits)                    |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`GatewayProvider`] | Downstream-facing facade, entry point |
//! | [`ChannelCache`] | Deduplicated upstream channels by name |
//! | [`MonitorEntry`] | One upstream subscription, fans out to subscribers |
//! | [`MonitorUser`] | One downstream subscription with a bounded queue |
//! | [`PvStructure`] | Structure value with bitset field accounting |
//! | [`RequestSignature`] | Normalized request, upstream dedup key |
//!
//! ## Guarantees
//!
//! - Per subscriber, deliveries embed into upstream event order; coalesced
//!   deliveries carry the union of their changed bits and flag fields that
//!   changed more than once in the overrun bitset. Updates are never
//!   dropped silently.
//! - Queues are bounded by the negotiated depth; overflow is expressed
//!   semantically (latest value wins plus overrun evidence), not by
//!   unbounded buffering.
//! - No downstream callback is ever invoked with a core lock held.
//!
//! ## Modules Overview
//!
//! - [`gateway`] - Public facade (start here)
//! - [`cache`] - Channel dedup table and eviction
//! - [`monitor`] - The fan-out multiplexer
//! - [`pvdata`] - Values, descriptors, bitsets
//! - [`request`] - Request normalization
//! - [`upstream`] / [`listener`] - Transport-facing and downstream traits
//! - [`admin`] - Status snapshots and instance accounting
//! - [`config`] - Constants and runtime configuration

/// Administrative surface (status snapshots, instance accounting).
pub mod admin;
/// Channel cache: name deduplication and grace eviction.
pub mod cache;
/// Compile-time constants and runtime configuration.
pub mod config;
/// Public gateway facade and error type.
pub mod gateway;
/// Downstream listener traits.
pub mod listener;
/// Monitor multiplexer: entries, users, elements, wake gate.
pub mod monitor;
/// Payload model: structure values and field bitsets.
pub mod pvdata;
/// Subscription request normalization.
pub mod request;
/// Transport-facing traits.
pub mod upstream;

#[cfg(test)]
pub(crate) mod testsupport;

pub use admin::{GatewayStatus, InstanceSnapshot};
pub use cache::{ChannelCache, ChannelEntry};
pub use config::{GatewayConfig, RewriteRule};
pub use gateway::{DownstreamChannel, Error, GatewayProvider, Result};
pub use listener::{ChannelRequester, MonitorRequester};
pub use monitor::{EventGate, MonitorElement, MonitorEntry, MonitorUser};
pub use pvdata::{BitSet, PvStructure, ScalarKind, ScalarValue, StructDef};
pub use request::RequestSignature;
pub use upstream::{ChannelState, UpstreamChannel, UpstreamMonitor, UpstreamProvider};
