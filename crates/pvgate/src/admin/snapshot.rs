// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Snapshot structures for the administrative status surface.
//!
//! Point-in-time views cloned out of the cache; no lock is held while a
//! report is formatted or shipped to the embedding host.

use std::fmt;

use crate::upstream::ChannelState;

/// View of a single cached channel (status level >= 1).
#[derive(Debug, Clone)]
pub struct ChannelView {
    pub name: String,
    pub state: ChannelState,
    /// Downstream channel wrappers holding the entry open.
    pub interested: usize,
    /// Deduplicated upstream subscriptions.
    pub monitors: usize,
    /// Attached downstream subscriptions across all monitors.
    pub subscribers: usize,
}

impl fmt::Display for ChannelView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Channel '{}' with {} clients, {} monitors, {} subscribers",
            self.state, self.name, self.interested, self.monitors, self.subscribers
        )
    }
}

/// Gateway status report.
#[derive(Debug, Clone, Default)]
pub struct GatewayStatus {
    pub channel_count: usize,
    /// Per-channel detail; empty at status level 0.
    pub channels: Vec<ChannelView>,
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cache has {} channels", self.channel_count)?;
        for channel in &self.channels {
            writeln!(f, "{}", channel)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        let status = GatewayStatus {
            channel_count: 1,
            channels: vec![ChannelView {
                name: "y.rec".into(),
                state: ChannelState::Connected,
                interested: 2,
                monitors: 1,
                subscribers: 2,
            }],
        };
        let text = status.to_string();
        assert!(text.starts_with("Cache has 1 channels\n"));
        assert!(text.contains("CONNECTED Channel 'y.rec' with 2 clients, 1 monitors, 2 subscribers"));
    }
}
