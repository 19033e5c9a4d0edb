// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wake/wait primitive for downstream consumers.
//!
//! `poll()` on a subscription never blocks; a consumer that wants to sleep
//! until data arrives waits on an [`EventGate`] that its `MonitorRequester`
//! signals from the wake callback. Edge-triggered: one `signal()` satisfies
//! one `wait_timeout()`.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Edge-triggered wake flag with a blocking wait.
#[derive(Debug, Default)]
pub struct EventGate {
    ready: AtomicBool,
    sleeping: Mutex<bool>,
    condvar: Condvar,
}

impl EventGate {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            sleeping: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Mark ready and wake a sleeping waiter, if any.
    pub fn signal(&self) {
        self.ready.store(true, Ordering::Release);
        // Racy check is fine: worst case is one extra notify
        if *self.sleeping.lock() {
            self.condvar.notify_one();
        }
    }

    /// Consume the ready flag without blocking.
    pub fn check_and_clear(&self) -> bool {
        self.ready.swap(false, Ordering::Acquire)
    }

    /// Block until signaled or `timeout` elapses. Returns true when
    /// signaled. Returns immediately when a signal is already pending.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.ready.swap(false, Ordering::Acquire) {
            return true;
        }

        let mut sleeping = self.sleeping.lock();
        if self.ready.swap(false, Ordering::Acquire) {
            return true;
        }

        *sleeping = true;
        let _ = self.condvar.wait_for(&mut sleeping, timeout);
        *sleeping = false;

        // A signal racing the timeout still counts as a wake
        self.ready.swap(false, Ordering::Acquire)
    }
}
