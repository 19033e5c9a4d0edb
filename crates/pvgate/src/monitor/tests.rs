// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multiplexer scenario tests.
//!
//! These drive a [`MonitorEntry`] directly through its `MonitorSink` trait,
//! exactly as an upstream transport would, and consume through
//! [`MonitorUser`] as a downstream worker would.

use super::*;
use crate::listener::MonitorRequester;
use crate::pvdata::{BitSet, PvStructure, ScalarKind, ScalarValue, StructDef};
use crate::request::RequestSignature;
use crate::testsupport::GateRequester;
use crate::upstream::MonitorSink;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

fn xy_type() -> Arc<StructDef> {
    StructDef::builder("xy_t")
        .add("x", ScalarKind::Int)
        .add("y", ScalarKind::Int)
        .build()
}

fn xy_value(x: i32, y: i32) -> PvStructure {
    let mut v = PvStructure::new(xy_type());
    v.set_scalar("x", ScalarValue::Int(x));
    v.set_scalar("y", ScalarValue::Int(y));
    v
}

// x=1, y=2 in the depth-first offset assignment
const X_BIT: usize = 1;
const Y_BIT: usize = 2;

fn connected_entry(queue_size: usize) -> Arc<MonitorEntry> {
    let entry = MonitorEntry::new(Weak::new(), RequestSignature::with_queue_size(queue_size));
    entry.monitor_connect(xy_type(), &xy_value(1, 2));
    entry
}

fn post(entry: &MonitorEntry, value: PvStructure, bits: &[usize]) {
    let changed: BitSet = bits.iter().copied().collect();
    entry.monitor_event(&value, &changed, &BitSet::new());
}

#[test]
fn test_single_subscriber_initial() {
    let entry = connected_entry(2);
    let requester = GateRequester::new();
    let user = entry.attach(requester.clone());
    user.start();

    let element = user.poll().expect("initial element");
    assert_eq!(element.value.get_int("x"), Some(1));
    assert_eq!(element.value.get_int("y"), Some(2));
    assert_eq!(element.changed, BitSet::new().with(0));
    assert!(element.overrun.is_empty());
    user.release(element);

    assert!(user.poll().is_none());
    assert_eq!(requester.connect_count(), 1);
}

#[test]
fn test_two_subscribers_share_entry() {
    let entry = connected_entry(2);
    let r1 = GateRequester::new();
    let r2 = GateRequester::new();
    let u1 = entry.attach(r1.clone());
    let u2 = entry.attach(r2.clone());
    u1.start();
    u2.start();
    assert_eq!(entry.user_count(), 2);

    for user in [&u1, &u2] {
        let element = user.poll().expect("initial");
        assert_eq!(element.changed, BitSet::new().with(0));
        user.release(element);
    }

    post(&entry, xy_value(42, 2), &[X_BIT]);

    for user in [&u1, &u2] {
        let element = user.poll().expect("update");
        assert_eq!(element.value.get_int("x"), Some(42));
        assert_eq!(element.value.get_int("y"), Some(2));
        assert_eq!(element.changed, BitSet::new().with(X_BIT));
        assert!(element.overrun.is_empty());
        assert!(user.poll().is_none());
        user.release(element);
    }
}

#[test]
fn test_overflow_latest_value_wins_with_overrun() {
    let entry = connected_entry(3);
    let requester = GateRequester::new();
    let user = entry.attach(requester.clone());
    user.start();

    // hold the initial element while the burst arrives (one slot in flight)
    let initial = user.poll().expect("initial");

    for x in [50, 51, 52, 53] {
        post(&entry, xy_value(x, 2), &[X_BIT]);
        assert!(user.queue_len() <= 3, "queue must stay bounded");
    }

    let first = user.poll().expect("first update");
    assert_eq!(first.value.get_int("x"), Some(50));
    assert_eq!(first.changed, BitSet::new().with(X_BIT));
    assert!(first.overrun.is_empty());

    // freeing a slot delivers the coalesced remainder
    user.release(initial);

    let second = user.poll().expect("second update");
    assert_eq!(second.value.get_int("x"), Some(51));
    assert!(second.overrun.is_empty());

    let third = user.poll().expect("coalesced update");
    assert_eq!(third.value.get_int("x"), Some(53), "latest value wins");
    assert_eq!(third.value.get_int("y"), Some(2));
    assert_eq!(third.changed, BitSet::new().with(X_BIT));
    assert_eq!(third.overrun, BitSet::new().with(X_BIT), "x changed twice");

    assert!(user.poll().is_none());
    user.release(first);
    user.release(second);
    user.release(third);
}

#[test]
fn test_stopped_subscriber_accumulates() {
    let entry = connected_entry(2);
    let requester = GateRequester::new();
    let user = entry.attach(requester.clone());
    user.start();
    let initial = user.poll().expect("initial");
    user.release(initial);

    user.stop();
    post(&entry, xy_value(10, 2), &[X_BIT]);
    post(&entry, xy_value(10, 20), &[Y_BIT]);
    assert!(user.poll().is_none(), "stopped user polls empty");
    assert_eq!(user.queue_len(), 0, "no slots consumed while stopped");

    user.start();
    let element = user.poll().expect("accumulated update");
    assert_eq!(element.value.get_int("x"), Some(10));
    assert_eq!(element.value.get_int("y"), Some(20));
    assert_eq!(element.changed, BitSet::new().with(X_BIT).with(Y_BIT));
    assert!(element.overrun.is_empty(), "each field changed once");
    user.release(element);
}

#[test]
fn test_pipeline_credit_gates_delivery() {
    let entry = MonitorEntry::new(
        Weak::new(),
        RequestSignature::with_queue_size(4).pipelined(),
    );
    entry.monitor_connect(xy_type(), &xy_value(1, 2));

    let requester = GateRequester::new();
    let user = entry.attach(requester.clone());
    user.start();

    post(&entry, xy_value(5, 2), &[X_BIT]);
    post(&entry, xy_value(6, 2), &[X_BIT]);
    assert_eq!(user.queue_len(), 0, "no credit, queue stays empty");
    assert!(user.in_overflow());

    user.ack(2);
    assert_eq!(user.queue_len(), 1, "one element per flush");
    assert_eq!(user.credit(), 1);

    let element = user.poll().expect("credited element");
    // merged: whole-value initial plus both x updates, x changed twice
    assert_eq!(element.value.get_int("x"), Some(6));
    assert_eq!(element.changed, BitSet::new().with(0).with(X_BIT));
    assert_eq!(element.overrun, BitSet::new().with(X_BIT));
    user.release(element);
}

#[test]
fn test_attach_then_detach_produces_nothing() {
    // upstream never connected: no event between attach and detach
    let entry = MonitorEntry::new(Weak::new(), RequestSignature::with_queue_size(2));
    let requester = GateRequester::new();
    let user = entry.attach(requester.clone());
    user.start();

    assert!(user.poll().is_none());
    user.cancel();

    assert!(user.is_dead());
    assert!(requester.was_unlistened());
    assert_eq!(requester.connect_count(), 0);
    assert_eq!(entry.user_count(), 0);
}

#[test]
fn test_detach_one_leaves_other_attached() {
    let entry = connected_entry(2);
    let r1 = GateRequester::new();
    let r2 = GateRequester::new();
    let u1 = entry.attach(r1.clone());
    let u2 = entry.attach(r2.clone());
    u1.start();
    u2.start();

    u1.cancel();
    assert_eq!(entry.user_count(), 1);
    assert!(r1.was_unlistened());
    assert!(!r2.was_unlistened());

    post(&entry, xy_value(7, 2), &[X_BIT]);
    assert!(u1.poll().is_none(), "no delivery after cancel");

    // u2 still has its initial plus the update
    let initial = u2.poll().expect("initial");
    u2.release(initial);
    let update = u2.poll().expect("update");
    assert_eq!(update.value.get_int("x"), Some(7));
    u2.release(update);
}

#[test]
fn test_upstream_unlisten_terminal() {
    let entry = connected_entry(2);
    let requester = GateRequester::new();
    let user = entry.attach(requester.clone());
    user.start();

    entry.unlisten();

    assert!(requester.was_unlistened());
    assert!(user.is_dead());
    assert!(user.poll().is_none());
    assert_eq!(entry.user_count(), 0);

    // further events are ignored
    post(&entry, xy_value(9, 9), &[X_BIT]);
    assert!(user.poll().is_none());
}

#[test]
fn test_type_change_reannounces_and_resnapshots() {
    let entry = connected_entry(2);
    let requester = GateRequester::new();
    let user = entry.attach(requester.clone());
    user.start();
    let initial = user.poll().expect("initial");
    user.release(initial);
    assert_eq!(requester.connect_count(), 1);

    let wide = StructDef::builder("xyz_t")
        .add("x", ScalarKind::Int)
        .add("y", ScalarKind::Int)
        .add("z", ScalarKind::Double)
        .build();
    let mut value = PvStructure::new(Arc::clone(&wide));
    value.set_scalar("x", ScalarValue::Int(3));
    value.set_scalar("z", ScalarValue::Double(0.5));
    entry.monitor_connect(wide, &value);

    assert_eq!(requester.connect_count(), 2, "fresh descriptor announced");
    let element = user.poll().expect("fresh initial");
    assert_eq!(element.changed, BitSet::new().with(0));
    assert_eq!(element.value.dtype().type_id(), "xyz_t");
    assert_eq!(
        element.value.get_scalar("z"),
        Some(&ScalarValue::Double(0.5))
    );
    user.release(element);
}

#[test]
fn test_late_joiner_gets_current_snapshot() {
    let entry = connected_entry(2);
    let early = entry.attach(GateRequester::new());
    early.start();

    post(&entry, xy_value(100, 2), &[X_BIT]);

    let requester = GateRequester::new();
    let late = entry.attach(requester.clone());
    late.start();

    let element = late.poll().expect("synthesized initial");
    assert_eq!(element.value.get_int("x"), Some(100));
    assert_eq!(element.changed, BitSet::new().with(0));
    assert!(element.overrun.is_empty());
    late.release(element);
}

/// Requester that re-enters the subscription from inside the wake
/// callback. Passes only when callbacks run with no core lock held.
struct ReentrantRequester {
    user: Mutex<Option<Arc<MonitorUser>>>,
    polled: AtomicBool,
}

impl MonitorRequester for ReentrantRequester {
    fn monitor_connect(&self, _dtype: Arc<StructDef>) {}

    fn monitor_event(&self) {
        let slot = self.user.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(user) = slot.as_ref() {
            if let Some(element) = user.poll() {
                self.polled.store(true, Ordering::Release);
                user.release(element);
            }
        }
    }

    fn channel_state_change(&self, _state: crate::upstream::ChannelState) {}
    fn unlisten(&self) {}
}

#[test]
fn test_wake_callback_holds_no_core_lock() {
    let entry = connected_entry(2);
    let requester = Arc::new(ReentrantRequester {
        user: Mutex::new(None),
        polled: AtomicBool::new(false),
    });
    let user = entry.attach(requester.clone());
    *requester.user.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&user));

    user.start();
    post(&entry, xy_value(11, 2), &[X_BIT]);

    assert!(requester.polled.load(Ordering::Acquire));
}
