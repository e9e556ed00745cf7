// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::local::TrustKey;
use crate::time::Timestamp;
use crate::{Gid, HostAddr, Pid};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

/// Things the daemon does at a later time. Events name the entity they
/// concern by handle; when that entity goes away the daemon cancels them,
/// and a handle that no longer resolves is simply ignored when fired.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Event {
    Hello,
    Report(HostAddr),
    Handshake(HostAddr),
    /// The host missed its liveness deadline and is torn down.
    SuspectHost(HostAddr),
    /// A remote group learned from this host expires.
    SuspectGroup(HostAddr, Gid),
    /// A trust entry of local process `Pid` missed its freshness deadline.
    Suspect(Pid, TrustKey),
}

impl Event {
    pub fn host(&self) -> Option<HostAddr> {
        match self {
            Event::Hello => None,
            Event::Report(a)
            | Event::Handshake(a)
            | Event::SuspectHost(a)
            | Event::SuspectGroup(a, _) => Some(*a),
            Event::Suspect(_, key) => Some(key.addr),
        }
    }
}

/// Position of a pending event: its firing time, then a serial number so
/// that events due at the same time fire in the order they were scheduled.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Slot {
    pub at: Timestamp,
    id: u64,
}

/// A time-ordered queue of unique events. Scheduling an event that is
/// already pending moves it, so each event exists at most once.
#[derive(Clone, Debug)]
pub struct Scheduler<E: Clone + Debug + Ord> {
    queue: BTreeMap<Slot, E>,
    index: BTreeMap<E, Slot>,
    next_id: u64,
}

impl<E: Clone + Debug + Ord> Default for Scheduler<E> {
    fn default() -> Self {
        Scheduler {
            queue: BTreeMap::new(),
            index: BTreeMap::new(),
            next_id: 0,
        }
    }
}

impl<E: Clone + Debug + Ord> Scheduler<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Schedules `ev` at `at`, replacing any pending copy.
    pub fn schedule(&mut self, ev: E, at: Timestamp) -> Slot {
        self.cancel(&ev);
        let slot = Slot {
            at,
            id: self.next_id,
        };
        self.next_id += 1;
        self.queue.insert(slot, ev.clone());
        self.index.insert(ev, slot);
        slot
    }

    /// Schedules `ev` at `at` unless it is already pending at or before `at`.
    pub fn schedule_by(&mut self, ev: E, at: Timestamp) {
        match self.when(&ev) {
            Some(t) if t <= at => (),
            _ => {
                self.schedule(ev, at);
            }
        }
    }

    pub fn cancel(&mut self, ev: &E) -> bool {
        match self.index.remove(ev) {
            Some(slot) => {
                self.queue.remove(&slot);
                true
            }
            None => false,
        }
    }

    pub fn cancel_where<F: Fn(&E) -> bool>(&mut self, pred: F) -> usize {
        let doomed: Vec<E> = self.index.keys().filter(|e| pred(*e)).cloned().collect();
        for ev in doomed.iter() {
            self.cancel(ev);
        }
        doomed.len()
    }

    pub fn when(&self, ev: &E) -> Option<Timestamp> {
        self.index.get(ev).map(|s| s.at)
    }

    pub fn is_pending(&self, ev: &E) -> bool {
        self.index.contains_key(ev)
    }

    pub fn count_where<F: Fn(&E) -> bool>(&self, pred: F) -> usize {
        self.index.keys().filter(|e| pred(*e)).count()
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.queue.keys().next().map(|s| s.at)
    }

    /// Snapshot of every slot due at `now`, in firing order. Firing is a
    /// separate step (`take`), so events scheduled while the snapshot is
    /// being worked through wait for the next pass.
    pub fn due(&self, now: Timestamp) -> Vec<Slot> {
        let end = Slot {
            at: now,
            id: u64::MAX,
        };
        self.queue.range(..=end).map(|(s, _)| *s).collect()
    }

    /// Removes and returns the event still occupying `slot`. A slot whose
    /// event was cancelled or moved yields nothing.
    pub fn take(&mut self, slot: Slot) -> Option<E> {
        let ev = self.queue.remove(&slot)?;
        self.index.remove(&ev);
        Some(ev)
    }

    /// Time from `now` until the next event; zero if one is overdue, `None`
    /// if the queue is empty.
    pub fn timeout(&self, now: Timestamp) -> Option<Duration> {
        self.next_deadline().map(|t| t.duration_since(now))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Timestamp, &E)> {
        self.queue.iter().map(|(s, e)| (s.at, e))
    }
}
