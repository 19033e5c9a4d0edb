// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One downstream subscription.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use super::{MonitorElement, MonitorEntry};
use crate::admin::counters::{CountGuard, InstanceClass};
use crate::listener::MonitorRequester;
use crate::pvdata::{BitSet, PvStructure};
use crate::request::RequestSignature;

/// Queue and accounting state, all behind one lock (innermost in the lock
/// order: cache -> channel -> entry -> user).
struct UserState {
    queue: VecDeque<Box<MonitorElement>>,
    free: Vec<Box<MonitorElement>>,
    /// Fields changed since the last slot was filled. Survives overflow.
    changed: BitSet,
    /// Fields changed more than once since the last slot was filled.
    overrun: BitSet,
    running: bool,
    in_overflow: bool,
    initial_sent: bool,
    /// The current type descriptor has been announced downstream.
    type_seen: bool,
    /// Remaining pipeline credits; unused unless the signature pipelines.
    credit: u32,
    /// Set once on cancel/unlisten; everything becomes a no-op after.
    dead: bool,
}

/// One downstream subscription: bounded element queue, accumulated
/// changed/overrun bitsets and (optionally) a pipeline credit window.
///
/// `poll` never blocks. A consumer that wants to sleep pairs its
/// [`MonitorRequester`] wake callback with an
/// [`EventGate`](super::EventGate).
pub struct MonitorUser {
    entry: Weak<MonitorEntry>,
    requester: Arc<dyn MonitorRequester>,
    queue_size: usize,
    pipeline: bool,
    state: Mutex<UserState>,
    _count: CountGuard,
}

impl MonitorUser {
    pub(crate) fn new(
        entry: Weak<MonitorEntry>,
        signature: &RequestSignature,
        requester: Arc<dyn MonitorRequester>,
    ) -> Arc<Self> {
        let queue_size = signature.queue_size();
        let free = (0..queue_size).map(|_| MonitorElement::placeholder()).collect();
        Arc::new(Self {
            entry,
            requester,
            queue_size,
            pipeline: signature.pipeline(),
            state: Mutex::new(UserState {
                queue: VecDeque::with_capacity(queue_size),
                free,
                changed: BitSet::new(),
                overrun: BitSet::new(),
                running: false,
                in_overflow: false,
                initial_sent: false,
                type_seen: false,
                credit: 0,
                dead: false,
            }),
            _count: CountGuard::new(InstanceClass::MonitorUser),
        })
    }

    /// Negotiated queue depth.
    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    /// Whether this subscription uses credit-based flow control.
    pub fn pipeline(&self) -> bool {
        self.pipeline
    }

    /// Begin delivering. Pending accumulated updates (including a not yet
    /// delivered initial) are flushed if a slot and credit are available.
    pub fn start(&self) {
        {
            let mut st = self.state.lock();
            if st.dead || st.running {
                return;
            }
            st.running = true;
        }
        self.refill_from_entry();
    }

    /// Stop delivering. `poll` returns empty until restarted; updates keep
    /// accumulating into the changed/overrun bitsets meanwhile.
    pub fn stop(&self) {
        let mut st = self.state.lock();
        st.running = false;
    }

    /// Non-blocking take of the next queued element. The caller returns the
    /// element through [`release`](Self::release) when done with it.
    pub fn poll(&self) -> Option<Box<MonitorElement>> {
        let mut st = self.state.lock();
        if st.dead || !st.running {
            return None;
        }
        st.queue.pop_front()
    }

    /// Return an element to the free list. If an overflow is pending, the
    /// freed slot is immediately re-used to deliver the coalesced update.
    pub fn release(&self, element: Box<MonitorElement>) {
        let pending = {
            let mut st = self.state.lock();
            if st.free.len() + st.queue.len() >= self.queue_size {
                // released more than was polled; drop the excess
                log::warn!("[MONITOR] release beyond queue capacity, discarding slot");
                return;
            }
            st.free.push(element);
            st.in_overflow && !st.dead && st.running
        };
        if pending {
            self.refill_from_entry();
        }
    }

    /// Grant pipeline credits from the downstream peer.
    ///
    /// Out-of-credit subscriptions accumulate exactly like full-queue ones;
    /// granting credit releases the coalesced update.
    pub fn ack(&self, credits: u32) {
        let pending = {
            let mut st = self.state.lock();
            if st.dead {
                return;
            }
            st.credit = st.credit.saturating_add(credits);
            self.pipeline && st.in_overflow && st.running
        };
        if pending {
            self.refill_from_entry();
        }
    }

    /// Detach from the fan-out and signal terminal `unlisten` downstream.
    /// Idempotent; safe to call concurrently with upstream events.
    pub fn cancel(&self) {
        if let Some(entry) = self.entry.upgrade() {
            entry.detach(self);
        }
        self.terminate();
    }

    /// True once cancelled or terminally unlistened.
    pub fn is_dead(&self) -> bool {
        self.state.lock().dead
    }

    /// Current queue occupancy.
    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether an overflow (coalesced update) is pending delivery.
    pub fn in_overflow(&self) -> bool {
        self.state.lock().in_overflow
    }

    /// Remaining pipeline credits.
    pub fn credit(&self) -> u32 {
        self.state.lock().credit
    }

    // ====================================================================
    // Fan-out internals, called by MonitorEntry (entry lock held; the user
    // lock nests inside it)
    // ====================================================================

    pub(crate) fn requester_arc(&self) -> Arc<dyn MonitorRequester> {
        Arc::clone(&self.requester)
    }

    /// Accept one upstream event. Returns the requester to wake when the
    /// queue transitioned empty -> non-empty.
    pub(crate) fn offer(
        &self,
        snapshot: &PvStructure,
        changed: &BitSet,
        overrun: &BitSet,
    ) -> Option<Arc<dyn MonitorRequester>> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.dead {
            return None;
        }
        // Accumulate first: a field already pending that changes again has
        // changed more than once since the last delivery.
        st.overrun.or_with(overrun);
        st.overrun.or_and(&st.changed, changed);
        st.changed.or_with(changed);
        if !st.running {
            return None;
        }
        self.try_push(st, snapshot)
    }

    /// Accept a (re)connect: the whole value is considered changed.
    pub(crate) fn accept_connect(
        &self,
        snapshot: &PvStructure,
    ) -> Option<Arc<dyn MonitorRequester>> {
        let whole = BitSet::new().with(0);
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.dead {
            return None;
        }
        st.overrun.or_and(&st.changed, &whole);
        st.changed.set(0);
        st.initial_sent = true;
        if !st.running {
            return None;
        }
        self.try_push(st, snapshot)
    }

    /// Flush accumulated bits into a slot if one is available. Used on
    /// start, on release while in overflow and on credit grant.
    pub(crate) fn flush(&self, snapshot: &PvStructure) -> Option<Arc<dyn MonitorRequester>> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if st.dead || !st.running {
            return None;
        }
        self.try_push(st, snapshot)
    }

    /// Mark the current type announced; returns true when the caller must
    /// deliver a `monitor_connect` callback.
    pub(crate) fn mark_type_seen(&self) -> bool {
        let mut st = self.state.lock();
        if st.dead || st.type_seen {
            return false;
        }
        st.type_seen = true;
        true
    }

    /// Force re-announcement of the type descriptor (upstream shape change).
    pub(crate) fn reset_type_seen(&self) {
        self.state.lock().type_seen = false;
    }

    /// Terminal teardown: drain the queue, drop the slots, signal
    /// `unlisten` downstream exactly once.
    pub(crate) fn terminate(&self) {
        {
            let mut st = self.state.lock();
            if st.dead {
                return;
            }
            st.dead = true;
            st.queue.clear();
            st.free.clear();
            st.changed.clear_all();
            st.overrun.clear_all();
        }
        self.requester.unlisten();
    }

    fn try_push(
        &self,
        st: &mut UserState,
        snapshot: &PvStructure,
    ) -> Option<Arc<dyn MonitorRequester>> {
        if st.changed.is_empty() {
            return None;
        }
        if st.free.is_empty() || (self.pipeline && st.credit == 0) {
            st.in_overflow = true;
            return None;
        }
        let mut slot = st.free.pop()?;
        slot.value = snapshot.clone();
        slot.changed = st.changed.take();
        slot.overrun = st.overrun.take();
        if self.pipeline {
            st.credit -= 1;
        }
        st.queue.push_back(slot);
        st.in_overflow = false;
        if st.queue.len() == 1 {
            Some(Arc::clone(&self.requester))
        } else {
            None
        }
    }

    fn refill_from_entry(&self) {
        if let Some(entry) = self.entry.upgrade() {
            entry.refill(self);
        }
    }
}

impl std::fmt::Debug for MonitorUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("MonitorUser")
            .field("queue_size", &self.queue_size)
            .field("pipeline", &self.pipeline)
            .field("queued", &st.queue.len())
            .field("running", &st.running)
            .field("in_overflow", &st.in_overflow)
            .field("initial_sent", &st.initial_sent)
            .field("dead", &st.dead)
            .finish()
    }
}
