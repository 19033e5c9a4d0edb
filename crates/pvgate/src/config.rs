// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gateway configuration - single source of truth.
//!
//! Two levels:
//!
//! - **Level 1 (static)**: compile-time constants (queue bounds, sweep
//!   cadence). **Never hardcode these elsewhere.**
//! - **Level 2 (dynamic)**: [`GatewayConfig`], deserializable from the
//!   embedding host's configuration file.

use serde::Deserialize;

// =======================================================================
// Queue bounds
// =======================================================================

/// Smallest downstream queue depth the gateway will negotiate.
///
/// A queue of one slot cannot distinguish "latest value" from "value being
/// consumed", so requests below this are clamped up.
pub const MIN_QUEUE_SIZE: usize = 2;

/// Queue depth used when a request carries no `queueSize` option.
pub const DEFAULT_QUEUE_SIZE: usize = 2;

// =======================================================================
// Cache eviction
// =======================================================================

/// Default period of the cache eviction sweep (milliseconds).
///
/// An unreferenced channel survives at most two sweep ticks: one consuming
/// its grace poke, one dropping it.
pub const DEFAULT_SWEEP_PERIOD_MS: u64 = 30_000;

// =======================================================================
// Runtime configuration
// =======================================================================

/// One name-rewrite rule: a served name prefix mapped to the prefix used
/// for upstream lookup.
///
/// Rewriting exists to break loops when the same process hosts both the
/// server and client side of the protocol. The classic deployment serves
/// names starting with `x` and resolves them upstream as `y`:
///
/// ```text
/// [[name_rewrites]]
/// from_prefix = "x"
/// to_prefix   = "y"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RewriteRule {
    pub from_prefix: String,
    pub to_prefix: String,
}

impl RewriteRule {
    /// Apply this rule, or `None` when the prefix does not match.
    pub fn apply(&self, name: &str) -> Option<String> {
        name.strip_prefix(self.from_prefix.as_str())
            .map(|rest| format!("{}{}", self.to_prefix, rest))
    }
}

/// Gateway runtime configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Cache sweep period in milliseconds.
    pub sweep_period_ms: u64,
    /// Name-rewrite rules, applied before any cache access. First matching
    /// rule wins; a non-matching name is looked up unchanged.
    pub name_rewrites: Vec<RewriteRule>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            sweep_period_ms: DEFAULT_SWEEP_PERIOD_MS,
            name_rewrites: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Rewrite a served name into its upstream lookup name.
    pub fn rewrite<'a>(&self, name: &'a str) -> std::borrow::Cow<'a, str> {
        for rule in &self.name_rewrites {
            if let Some(rewritten) = rule.apply(name) {
                return std::borrow::Cow::Owned(rewritten);
            }
        }
        std::borrow::Cow::Borrowed(name)
    }
}
