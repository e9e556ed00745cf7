// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Omega leader election. Each group keeps a set of local contenders (the
//! candidate processes on this host, in registration order) and a set of
//! global contenders (this host's local leader plus the remote leaders it
//! currently trusts). The global leader is the global contender with the
//! smallest accusation time, address breaking ties. Suspecting a remote
//! contender sends its host an accusation, which pushes that host's
//! accusation time forward and so lets someone else win.

use crate::error::{Error, Result};
use crate::local::Interrupt;
use crate::message::{Accusation, Dest, ElectionVars, LeaderView, Message, Output};
use crate::time::Timestamp;
use crate::{Gid, HostAddr, Pid};
use im::{OrdMap, OrdSet as ArcOrdSet};
use pergola::{LatticeElt, MaxDef};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Accusation times only move forward, so they are kept as a max-lattice of
/// microsecond timestamps and merged by join.
pub type StampLD = MaxDef<u64>;
pub type StampLE = LatticeElt<StampLD>;

fn stamp(t: Timestamp) -> StampLE {
    StampLE::new_from(t.micros())
}

fn stamp_time(s: &StampLE) -> Timestamp {
    Timestamp::from_micros(s.value)
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Contender {
    pub addr: HostAddr,
    pub pid: Pid,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Subscriber {
    pub interrupt: Interrupt,
    pub notified: bool,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct GroupElection {
    pub local_contenders: Vec<Pid>,
    pub global_contenders: ArcOrdSet<Contender>,
    pub local_leader: Option<Pid>,
    pub view: LeaderView,
    pub accusation_time: StampLE,
    pub start_time: Timestamp,
    pub subscribers: OrdMap<Pid, Subscriber>,
}

impl GroupElection {
    fn new(now: Timestamp) -> Self {
        GroupElection {
            local_contenders: Vec::new(),
            global_contenders: ArcOrdSet::new(),
            local_leader: None,
            view: LeaderView::default(),
            accusation_time: stamp(now),
            start_time: Timestamp::ZERO,
            subscribers: OrdMap::new(),
        }
    }
}

/// What a peer last told us about its own candidacy in a group.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct RemoteVars {
    pub accusation_time: StampLE,
    pub start_time: Timestamp,
    pub leader: Option<Contender>,
}

/// A local process that must start or stop sending alives.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct Handover {
    pub pid: Pid,
    pub gid: Gid,
    pub sending: bool,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ElectionState {
    pub local_addr: HostAddr,
    groups: OrdMap<Gid, GroupElection>,
    remote: OrdMap<(HostAddr, Gid), RemoteVars>,
    handovers: Vec<Handover>,
}

impl ElectionState {
    pub fn new(local_addr: HostAddr) -> Self {
        ElectionState {
            local_addr,
            groups: OrdMap::new(),
            remote: OrdMap::new(),
            handovers: Vec::new(),
        }
    }

    pub fn group(&self, gid: Gid) -> Option<&GroupElection> {
        self.groups.get(&gid)
    }

    pub fn has_group(&self, gid: Gid) -> bool {
        self.groups.contains_key(&gid)
    }

    pub fn leader(&self, gid: Gid) -> Option<LeaderView> {
        self.groups.get(&gid).map(|g| g.view)
    }

    pub fn remote_vars(&self, addr: HostAddr, gid: Gid) -> Option<&RemoteVars> {
        self.remote.get(&(addr, gid))
    }

    /// Alive-sending changes decided since the last call.
    pub fn drain_handovers(&mut self) -> Vec<Handover> {
        std::mem::take(&mut self.handovers)
    }

    /// Our election variables for `gid`, as carried in reports.
    pub fn local_vars(&self, gid: Gid) -> Option<ElectionVars> {
        self.groups.get(&gid).map(|g| ElectionVars {
            gid,
            accusation_time: stamp_time(&g.accusation_time),
            start_time: g.start_time,
            leader: g.view.leader,
        })
    }

    /// Subscribes `pid` to `gid`, creating the group's election state if
    /// this is its first local member, and enters it as a contender if it is
    /// a candidate.
    pub fn join(
        &mut self,
        gid: Gid,
        pid: Pid,
        candidate: bool,
        interrupt: Interrupt,
        now: Timestamp,
        out: &mut Vec<Output>,
    ) {
        let g = self
            .groups
            .entry(gid)
            .or_insert_with(|| GroupElection::new(now));
        g.subscribers.insert(
            pid,
            Subscriber {
                interrupt,
                notified: false,
            },
        );
        if candidate && !g.local_contenders.contains(&pid) {
            g.local_contenders.push(pid);
            self.update_local_leader(gid, now, out);
        } else {
            self.recompute(gid, now, out);
        }
    }

    /// Unsubscribes `pid` from `gid`, dropping the group entirely once its
    /// last local member leaves.
    pub fn leave(&mut self, gid: Gid, pid: Pid, now: Timestamp, out: &mut Vec<Output>) {
        let g = match self.groups.get_mut(&gid) {
            Some(g) => g,
            None => return,
        };
        g.subscribers.remove(&pid);
        if g.subscribers.is_empty() {
            debug!("group {} has no local members left", gid);
            self.groups.remove(&gid);
            let stale: Vec<_> = self
                .remote
                .keys()
                .filter(|(_, g)| *g == gid)
                .cloned()
                .collect();
            for k in stale {
                self.remote.remove(&k);
            }
            return;
        }
        let was_candidate = g.local_contenders.contains(&pid);
        g.local_contenders.retain(|p| *p != pid);
        if g.local_contenders.is_empty() {
            if g.local_leader.take().is_some() {
                g.global_contenders = without_addr(&g.global_contenders, self.local_addr);
            }
            self.recompute(gid, now, out);
        } else if was_candidate {
            self.update_local_leader(gid, now, out);
        }
    }

    pub fn set_interrupt(&mut self, gid: Gid, pid: Pid, interrupt: Interrupt) -> Result<()> {
        let s = self
            .groups
            .get_mut(&gid)
            .and_then(|g| g.subscribers.get_mut(&pid))
            .ok_or(Error::NotMember { pid, gid })?;
        s.interrupt = interrupt;
        if interrupt == Interrupt::None {
            s.notified = false;
        }
        Ok(())
    }

    /// Recomputes the local leader of `gid` and, if it changed, swaps it into
    /// the global contenders and recomputes the global leader. Otherwise
    /// only subscribers that were never notified hear about the current
    /// leader.
    pub fn update_local_leader(&mut self, gid: Gid, now: Timestamp, out: &mut Vec<Output>) {
        let local = self.local_addr;
        let g = match self.groups.get_mut(&gid) {
            Some(g) => g,
            None => return,
        };
        let new = g.local_contenders.first().cloned();
        if new == g.local_leader {
            notify(gid, g, false, out);
            return;
        }
        trace!("group {} local leader {:?} -> {:?}", gid, g.local_leader, new);
        g.global_contenders = without_addr(&g.global_contenders, local);
        if let Some(pid) = new {
            g.global_contenders.insert(Contender { addr: local, pid });
        }
        g.local_leader = new;
        self.recompute(gid, now, out);
    }

    /// `update_global_leader` with lookup failures logged rather than
    /// returned; the next trigger retries.
    pub fn recompute(&mut self, gid: Gid, now: Timestamp, out: &mut Vec<Output>) {
        if let Err(e) = self.update_global_leader(gid, now, out) {
            debug!("group {} leader recomputation skipped: {}", gid, e);
        }
    }

    /// Picks the global leader of `gid` among its global contenders and
    /// notifies subscribers. A contender whose accusation time is unknown
    /// aborts the recomputation without changing anything.
    pub fn update_global_leader(
        &mut self,
        gid: Gid,
        now: Timestamp,
        out: &mut Vec<Output>,
    ) -> Result<()> {
        let local = self.local_addr;
        let g = match self.groups.get_mut(&gid) {
            Some(g) => g,
            None => return Err(Error::UnknownGroup(gid)),
        };
        let mut best: Option<(u64, Contender)> = None;
        let mut remote_count = 0;
        for c in g.global_contenders.iter() {
            let acc = if c.addr == local {
                g.accusation_time.value
            } else {
                remote_count += 1;
                match self.remote.get(&(c.addr, gid)) {
                    Some(v) => v.accusation_time.value,
                    None => return Err(Error::MissingVars { addr: c.addr, gid }),
                }
            };
            let better = match &best {
                None => true,
                Some((b_acc, b)) => (acc, c.addr) < (*b_acc, b.addr),
            };
            if better {
                best = Some((acc, *c));
            }
        }
        let winner = best.map(|(_, c)| c);
        let old = g.view.leader;

        if winner != old {
            debug!("group {} leader {:?} -> {:?}", gid, old, winner);
            if let Some(o) = old {
                if o.addr == local {
                    // Handing over to another local pid restarts below.
                    if winner.map_or(true, |w| w.addr != local) {
                        g.start_time = now;
                    }
                    self.handovers.push(Handover {
                        pid: o.pid,
                        gid,
                        sending: false,
                    });
                }
            }
            if let Some(w) = winner {
                if w.addr == local {
                    g.start_time = now;
                    self.handovers.push(Handover {
                        pid: w.pid,
                        gid,
                        sending: true,
                    });
                }
            }
        }

        // Stable when at most one remote contender is known, whether or not
        // the leader is local.
        let view = LeaderView {
            leader: winner,
            stable: remote_count <= 1,
        };
        let changed = view != g.view;
        g.view = view;
        notify(gid, g, changed, out);
        Ok(())
    }

    /// Adds a remote leader advertised by `addr`. Only groups with local
    /// members track contenders.
    pub fn add_remote_contender(&mut self, gid: Gid, addr: HostAddr, pid: Pid) -> bool {
        if addr == self.local_addr {
            return false;
        }
        match self.groups.get_mut(&gid) {
            Some(g) => g.global_contenders.insert(Contender { addr, pid }).is_none(),
            None => false,
        }
    }

    /// Merges a peer's election variables. Returns whether the group is
    /// tracked here.
    pub fn store_remote_vars(&mut self, addr: HostAddr, vars: &ElectionVars) -> bool {
        if !self.groups.contains_key(&vars.gid) {
            return false;
        }
        let incoming = stamp(vars.accusation_time);
        let key = (addr, vars.gid);
        let merged = match self.remote.get(&key) {
            Some(v) => &v.accusation_time + &incoming,
            None => incoming,
        };
        self.remote.insert(
            key,
            RemoteVars {
                accusation_time: merged,
                start_time: vars.start_time,
                leader: vars.leader,
            },
        );
        true
    }

    /// Reacts to the suspicion of remote process `pid` on `addr` in `gid`:
    /// the contender is dropped and, if it was the last one from that host,
    /// the host is accused.
    pub fn on_suspected(
        &mut self,
        addr: HostAddr,
        pid: Pid,
        gid: Gid,
        now: Timestamp,
        out: &mut Vec<Output>,
    ) {
        if addr == self.local_addr {
            return;
        }
        let g = match self.groups.get_mut(&gid) {
            Some(g) => g,
            None => return,
        };
        if g.global_contenders.remove(&Contender { addr, pid }).is_none() {
            return;
        }
        if !g.global_contenders.iter().any(|c| c.addr == addr) {
            match self.remote.get(&(addr, gid)) {
                Some(v) => {
                    debug!("accusing {} in group {}", addr, gid);
                    out.push(Output::Send {
                        to: Dest::Host(addr),
                        msg: Message::Accusation(Accusation {
                            gid,
                            start_time: v.start_time,
                        }),
                    });
                }
                None => debug!("no start time known for {} in group {}", addr, gid),
            }
        }
        self.recompute(gid, now, out);
    }

    /// Applies an accusation against our candidacy in `acc.gid`. Accusations
    /// aimed at an earlier candidacy carry a stale start time and are
    /// ignored.
    pub fn on_accusation(&mut self, acc: &Accusation, now: Timestamp, out: &mut Vec<Output>) {
        let g = match self.groups.get_mut(&acc.gid) {
            Some(g) => g,
            None => return,
        };
        if g.local_leader.is_none() || g.start_time != acc.start_time {
            trace!("ignoring stale accusation for group {}", acc.gid);
            return;
        }
        let mut bumped = &g.accusation_time + &stamp(now);
        bumped.value += 1;
        debug!(
            "accused in group {}: accusation time {} -> {}",
            acc.gid, g.accusation_time.value, bumped.value
        );
        g.accusation_time = bumped;
        self.recompute(acc.gid, now, out);
    }

    /// Removes everything learned from `addr` and recomputes the groups it
    /// contributed to.
    pub fn forget_host(&mut self, addr: HostAddr, now: Timestamp, out: &mut Vec<Output>) {
        let stale: Vec<_> = self
            .remote
            .keys()
            .filter(|(a, _)| *a == addr)
            .cloned()
            .collect();
        for k in stale {
            self.remote.remove(&k);
        }
        let affected: Vec<Gid> = self
            .groups
            .iter()
            .filter(|(_, g)| g.global_contenders.iter().any(|c| c.addr == addr))
            .map(|(gid, _)| *gid)
            .collect();
        for gid in affected {
            if let Some(g) = self.groups.get_mut(&gid) {
                g.global_contenders = without_addr(&g.global_contenders, addr);
            }
            self.recompute(gid, now, out);
        }
    }
}

fn notify(gid: Gid, g: &mut GroupElection, changed: bool, out: &mut Vec<Output>) {
    let view = g.view;
    let due: Vec<Pid> = g
        .subscribers
        .iter()
        .filter(|(_, s)| s.interrupt == Interrupt::AnyChange && (changed || !s.notified))
        .map(|(pid, _)| *pid)
        .collect();
    for pid in due {
        if let Some(s) = g.subscribers.get_mut(&pid) {
            s.notified = true;
        }
        out.push(Output::Leader { to: pid, gid, view });
    }
}

fn without_addr(set: &ArcOrdSet<Contender>, addr: HostAddr) -> ArcOrdSet<Contender> {
    set.iter().filter(|c| c.addr != addr).cloned().collect()
}
