// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::cfg::{Config, Qos};
use crate::election::ElectionState;
use crate::error::{Error, Result};
use crate::host::RemoteHost;
use crate::local::{Interrupt, Locals, Monitor, TrustKey};
use crate::message::{LeaderView, Message, Output, TrustChange};
use crate::sched::{Event, Scheduler};
use crate::time::{Timestamp, Units};
use crate::{Gid, HostAddr, Pid};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace};

// A `Daemon` is driven like the other state machines in this crate: it never
// performs I/O or reads a clock itself. Every entry point takes the current
// time and an outgoing `Vec<Output>`, mutates the daemon, and pushes the
// effects the caller must carry out (sending messages, notifying local
// processes). The caller owns the sockets, the registration channel and the
// wait loop, sizing each wait with `run_due`'s return value.
//
// All state lives here, under one owner: the remote host table, the local
// process registry, the election state and the event queue. Cross-references
// between them are handles (addresses, pids, group ids), so destroying an
// entity means removing it from its table and cancelling the events that
// name it; any handle that slips through resolves to nothing.

/// The failure detector and leader oracle of one host.
#[derive(Debug)]
pub struct Daemon {
    pub addr: HostAddr,
    pub epoch: Timestamp,
    pub cfg: Config,
    pub(crate) hosts: BTreeMap<HostAddr, RemoteHost>,
    pub(crate) locals: Locals,
    pub(crate) election: ElectionState,
    pub(crate) sched: Scheduler<Event>,
    pub(crate) hello_seq: u32,
    rng: StdRng,
}

impl Daemon {
    /// Creates a daemon started at `epoch`. The first hello goes out after a
    /// random delay so that daemons started together do not collide.
    pub fn new(addr: HostAddr, epoch: Timestamp, cfg: Config) -> Result<Self> {
        cfg.validate()?;
        let rng = StdRng::seed_from_u64(cfg.seed ^ epoch.micros());
        let mut d = Daemon {
            addr,
            epoch,
            cfg,
            hosts: BTreeMap::new(),
            locals: Locals::default(),
            election: ElectionState::new(addr),
            sched: Scheduler::new(),
            hello_seq: 0,
            rng,
        };
        let first = epoch.add_units(d.jitter());
        d.sched.schedule(Event::Hello, first);
        debug!("daemon {} started at epoch {}", addr, epoch);
        Ok(d)
    }

    pub(crate) fn jitter(&mut self) -> Units {
        if self.cfg.hello_jitter == 0 {
            0
        } else {
            self.rng.gen_range(0..self.cfg.hello_jitter)
        }
    }

    pub fn host(&self, addr: HostAddr) -> Option<&RemoteHost> {
        self.hosts.get(&addr)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &RemoteHost> {
        self.hosts.values()
    }

    pub fn election(&self) -> &ElectionState {
        &self.election
    }

    pub fn scheduler(&self) -> &Scheduler<Event> {
        &self.sched
    }

    pub fn locals(&self) -> &Locals {
        &self.locals
    }

    /// Trust entries currently held by local process `pid`.
    pub fn trusted(&self, pid: Pid) -> Vec<TrustKey> {
        self.locals
            .get(pid)
            .map(|p| p.trusted.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Time until the next scheduled event, `None` if nothing is pending.
    pub fn timeout(&self, now: Timestamp) -> Option<Duration> {
        self.sched.timeout(now)
    }

    /// Dispatches a message received from `from` at `now`.
    pub fn receive(&mut self, msg: &Message, from: HostAddr, now: Timestamp, out: &mut Vec<Output>) {
        trace!("peer {} received {} from {}", self.addr, msg.kind(), from);
        match msg {
            Message::Report(r) => self.merge_report(r, from, now, out),
            Message::Hello(h) => self.merge_hello(h, from, now, out),
            Message::Handshake(h) => self.merge_handshake(h, from, now, out),
            Message::Accusation(a) => self.merge_accusation(a, from, now, out),
        }
    }

    /// Fires every event due at `now`. Events scheduled while firing wait for
    /// the next call. Returns the time until the next event.
    pub fn run_due(&mut self, now: Timestamp, out: &mut Vec<Output>) -> Option<Duration> {
        for slot in self.sched.due(now) {
            if let Some(ev) = self.sched.take(slot) {
                self.fire(ev, now, out);
            }
        }
        self.settle(now, out);
        self.sched.timeout(now)
    }

    fn fire(&mut self, ev: Event, now: Timestamp, out: &mut Vec<Output>) {
        trace!("peer {} firing {:?}", self.addr, ev);
        match ev {
            Event::Hello => {
                self.send_hello(out);
                let next = now.add_units(self.cfg.hello_interval);
                self.sched.schedule(Event::Hello, next);
            }
            Event::Report(addr) => self.send_report(addr, now, out),
            Event::Handshake(addr) => self.send_handshake(addr, None, now, out),
            Event::SuspectHost(addr) => {
                debug!("peer {} considers {} crashed", self.addr, addr);
                self.teardown_host(addr, now, out);
            }
            Event::SuspectGroup(addr, gid) => self.expire_remote_group(addr, gid),
            Event::Suspect(pid, key) => self.suspect(pid, key, now, out),
        }
    }

    /// Applies the alive-sending decisions of the election: members that
    /// start leading become visible in reports, which go out at once to
    /// every peer sharing the group.
    pub(crate) fn settle(&mut self, now: Timestamp, out: &mut Vec<Output>) {
        for h in self.election.drain_handovers() {
            if !self.locals.set_visible(h.pid, h.gid, h.sending, now) {
                continue;
            }
            debug!(
                "peer {} process {} {} alives for group {}",
                self.addr,
                h.pid,
                if h.sending { "starts" } else { "stops" },
                h.gid
            );
            out.push(Output::Alive {
                pid: h.pid,
                gid: h.gid,
                sending: h.sending,
            });
            if h.sending {
                let peers: Vec<HostAddr> = self
                    .hosts
                    .values()
                    .filter(|host| host.jointly.contains(&h.gid) && host.handshake_done())
                    .map(|host| host.addr)
                    .collect();
                for addr in peers {
                    self.report_now(addr, now);
                }
            }
        }
    }

    /// Finds the record for `addr`, creating it if needed. `epoch` is the
    /// peer's epoch when the triggering message carries one. Returns `None`
    /// for a message from an earlier incarnation of the peer, otherwise
    /// whether the record was created.
    pub(crate) fn locate_host(
        &mut self,
        addr: HostAddr,
        epoch: Option<Timestamp>,
        now: Timestamp,
        out: &mut Vec<Output>,
    ) -> Option<bool> {
        let known = self.hosts.get(&addr).map(|h| h.remote_epoch);
        match (known, epoch) {
            (None, _) => {}
            (Some(_), None) => return Some(false),
            (Some(old), Some(e)) if old.is_set() && e < old => {
                trace!("peer {} dropping message from old epoch of {}", self.addr, addr);
                return None;
            }
            (Some(old), Some(e)) if old.is_set() && e > old => {
                debug!("peer {} sees {} restarted at {}", self.addr, addr, e);
                self.teardown_host(addr, now, out);
            }
            (Some(_), Some(e)) => {
                if let Some(h) = self.hosts.get_mut(&addr) {
                    h.remote_epoch = e;
                }
                return Some(false);
            }
        }
        let host = RemoteHost::new(addr, epoch.unwrap_or(Timestamp::ZERO), &self.cfg);
        debug!("peer {} tracking new host {}", self.addr, addr);
        self.hosts.insert(addr, host);
        self.sched.schedule(Event::Handshake(addr), now);
        self.sched.schedule(
            Event::SuspectHost(addr),
            now.add_units(self.cfg.host_qos.tdu),
        );
        Some(true)
    }

    /// Forgets `addr` entirely: trust entries held on it are dropped as
    /// crashed, every event naming it is cancelled, and its election
    /// contributions are withdrawn.
    pub(crate) fn teardown_host(&mut self, addr: HostAddr, now: Timestamp, out: &mut Vec<Output>) {
        let mut lost = vec![];
        for p in self.locals.procs_mut() {
            let keys: Vec<TrustKey> = p.trusted_on(addr).map(|(k, _)| *k).collect();
            for k in keys {
                p.trusted.remove(&k);
                lost.push((p.pid, k));
            }
        }
        let n = self.sched.cancel_where(|e| e.host() == Some(addr));
        trace!("peer {} cancelled {} events for {}", self.addr, n, addr);
        for (pid, key) in lost {
            self.trust_lost(pid, key, TrustChange::Crashed, now, out);
        }
        self.election.forget_host(addr, now, out);
        self.hosts.remove(&addr);
    }

    fn expire_remote_group(&mut self, addr: HostAddr, gid: Gid) {
        let locals = &self.locals;
        let host = match self.hosts.get_mut(&addr) {
            Some(h) => h,
            None => return,
        };
        trace!("group {} of {} expired", gid, addr);
        host.remote_groups.remove(&gid);
        host.group_procs.remove(&gid);
        host.rebuild_jointly(|g| locals.has_group(g));
        self.recalc_sendint(addr);
    }

    fn suspect(&mut self, pid: Pid, key: TrustKey, now: Timestamp, out: &mut Vec<Output>) {
        let held = match self.locals.get_mut(pid) {
            Ok(p) => p.trusted.remove(&key).is_some(),
            Err(_) => false,
        };
        if held {
            debug!("process {} suspects {:?}", pid, key);
            self.trust_lost(pid, key, TrustChange::Suspected, now, out);
        }
    }

    /// Reports the loss of a trust entry: point-to-point monitors hear about
    /// it directly, group entries feed the election.
    pub(crate) fn trust_lost(
        &mut self,
        monitor: Pid,
        key: TrustKey,
        change: TrustChange,
        now: Timestamp,
        out: &mut Vec<Output>,
    ) {
        match key.gid {
            Some(gid) => self.election.on_suspected(key.addr, key.pid, gid, now, out),
            None => self.notify_trust(monitor, key, change, out),
        }
    }

    pub(crate) fn notify_trust(
        &self,
        monitor: Pid,
        key: TrustKey,
        change: TrustChange,
        out: &mut Vec<Output>,
    ) {
        let wants = self
            .locals
            .get(monitor)
            .ok()
            .and_then(|p| p.monitors.get(&(key.addr, key.pid)))
            .map_or(false, |m| m.interrupt == Interrupt::AnyChange);
        if wants {
            out.push(Output::Trust {
                to: monitor,
                addr: key.addr,
                pid: key.pid,
                change,
            });
        }
    }

    fn bump_servers_seq(&mut self, pid: Pid) {
        for h in self.hosts.values_mut() {
            if h.local_servers.contains(&pid) {
                h.local_servers_seq = h.local_servers_seq.wrapping_add(1);
            }
        }
    }

    fn refresh_group(&mut self, gid: Gid, now: Timestamp) {
        let locals = &self.locals;
        let mut fresh = vec![];
        for h in self.hosts.values_mut() {
            if !h.rebuild_jointly(|g| locals.has_group(g)).is_empty() && h.handshake_done() {
                fresh.push(h.addr);
            }
        }
        for addr in fresh {
            self.report_now(addr, now);
        }
        let peers: Vec<HostAddr> = self
            .hosts
            .values()
            .filter(|h| h.jointly.contains(&gid) || h.remote_groups.contains(&gid))
            .map(|h| h.addr)
            .collect();
        for addr in peers {
            self.recalc_sendint(addr);
        }
    }

    // Local commands.

    pub fn register(&mut self, pid: Pid) -> Result<()> {
        self.locals.register(pid)?;
        self.bump_servers_seq(pid);
        Ok(())
    }

    /// Removes `pid` and everything it subscribed to.
    pub fn unregister(&mut self, pid: Pid, now: Timestamp, out: &mut Vec<Output>) -> Result<()> {
        let p = self.locals.get(pid)?;
        let groups: Vec<Gid> = p.groups.keys().cloned().collect();
        let monitors: Vec<(HostAddr, Pid)> = p.monitors.keys().cloned().collect();
        for gid in groups {
            self.stop_omega(pid, gid, now, out)?;
        }
        for (addr, remote) in monitors {
            self.unmonitor_process(pid, addr, remote)?;
        }
        self.sched
            .cancel_where(|e| matches!(e, Event::Suspect(p, _) if *p == pid));
        self.locals.remove(pid)?;
        self.bump_servers_seq(pid);
        debug!("unregistered local process {}", pid);
        Ok(())
    }

    /// Joins `pid` to group `gid` for leader election. Candidates contend
    /// for leadership; `interrupt` selects leader-change notifications;
    /// `qos` bounds the detection of the other members.
    pub fn start_omega(
        &mut self,
        pid: Pid,
        gid: Gid,
        candidate: bool,
        interrupt: Interrupt,
        qos: Qos,
        now: Timestamp,
        out: &mut Vec<Output>,
    ) -> Result<()> {
        let qos = Qos::new(qos.tdu, qos.tmu, qos.tmrl)?;
        let fresh = self.locals.join(pid, gid, qos, now)?;
        debug!(
            "process {} joins group {} (candidate: {}, new group: {})",
            pid, gid, candidate, fresh
        );
        if fresh {
            let at = now.add_units(self.jitter());
            self.sched.schedule_by(Event::Hello, at);
        }
        self.refresh_group(gid, now);
        self.election.join(gid, pid, candidate, interrupt, now, out);
        self.settle(now, out);
        Ok(())
    }

    pub fn stop_omega(
        &mut self,
        pid: Pid,
        gid: Gid,
        now: Timestamp,
        out: &mut Vec<Output>,
    ) -> Result<()> {
        let (_, empty) = self.locals.leave(pid, gid)?;
        self.sched.cancel_where(
            |e| matches!(e, Event::Suspect(p, k) if *p == pid && k.gid == Some(gid)),
        );
        debug!("process {} leaves group {} (last: {})", pid, gid, empty);
        self.election.leave(gid, pid, now, out);
        self.refresh_group(gid, now);
        self.settle(now, out);
        Ok(())
    }

    pub fn change_interrupt_mode(&mut self, pid: Pid, gid: Gid, interrupt: Interrupt) -> Result<()> {
        let p = self.locals.get(pid)?;
        if !p.groups.contains_key(&gid) {
            return Err(Error::NotMember { pid, gid });
        }
        self.election.set_interrupt(gid, pid, interrupt)
    }

    /// Current leader of `gid` as seen by member `pid`.
    pub fn get_leader(&self, pid: Pid, gid: Gid) -> Result<LeaderView> {
        let p = self.locals.get(pid)?;
        if !p.groups.contains_key(&gid) {
            return Err(Error::NotMember { pid, gid });
        }
        self.election.leader(gid).ok_or(Error::UnknownGroup(gid))
    }

    /// Starts point-to-point monitoring of process `remote` on `addr`.
    pub fn monitor_process(
        &mut self,
        pid: Pid,
        addr: HostAddr,
        remote: Pid,
        qos: Qos,
        interrupt: Interrupt,
        now: Timestamp,
        out: &mut Vec<Output>,
    ) -> Result<()> {
        let qos = Qos::new(qos.tdu, qos.tmu, qos.tmrl)?;
        self.locals
            .add_monitor(pid, addr, remote, Monitor { qos, interrupt })?;
        debug!("process {} monitors {}/{}", pid, addr, remote);
        let _ = self.locate_host(addr, None, now, out);
        if self.hosts.get(&addr).map_or(false, |h| h.handshake_done()) {
            self.recalc_sendint(addr);
            self.report_now(addr, now);
        }
        Ok(())
    }

    pub fn unmonitor_process(&mut self, pid: Pid, addr: HostAddr, remote: Pid) -> Result<()> {
        if let Some(key) = self.locals.remove_monitor(pid, addr, remote)? {
            self.sched.cancel(&Event::Suspect(pid, key));
        }
        self.recalc_sendint(addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Dest, Handshake};

    fn addr(s: &str) -> HostAddr {
        s.parse().unwrap()
    }

    fn qos() -> Qos {
        Qos {
            tdu: 2000,
            tmu: 5000,
            tmrl: 600_000,
        }
    }

    fn daemon() -> Daemon {
        Daemon::new(addr("10.0.0.1"), Timestamp::from_units(1000), Config::default()).unwrap()
    }

    #[test]
    fn single_candidate_becomes_stable_leader() {
        let _ = pretty_env_logger::try_init();
        let mut d = daemon();
        let now = Timestamp::from_units(1001);
        let mut out = vec![];
        d.register(1).unwrap();
        d.start_omega(1, 7, true, Interrupt::AnyChange, qos(), now, &mut out)
            .unwrap();
        let view = d.get_leader(1, 7).unwrap();
        assert_eq!(view.leader.map(|c| (c.addr, c.pid)), Some((d.addr, 1)));
        assert!(view.stable);
        let alives: Vec<_> = out
            .iter()
            .filter(|o| matches!(o, Output::Alive { .. }))
            .collect();
        assert_eq!(
            alives,
            vec![&Output::Alive {
                pid: 1,
                gid: 7,
                sending: true
            }]
        );
        assert!(out.contains(&Output::Leader {
            to: 1,
            gid: 7,
            view
        }));
        assert_eq!(d.locals().visible_pids(7), vec![1]);

        // Nothing changes on later passes.
        out.clear();
        d.run_due(now.add_units(1), &mut out);
        assert!(!out.iter().any(|o| matches!(o, Output::Alive { .. })));
    }

    #[test]
    fn command_errors() {
        let mut d = daemon();
        let now = Timestamp::from_units(1001);
        let mut out = vec![];
        assert_eq!(
            d.start_omega(1, 7, true, Interrupt::None, qos(), now, &mut out),
            Err(Error::UnknownProcess(1))
        );
        d.register(1).unwrap();
        let bad = Qos {
            tdu: 0,
            tmu: 1,
            tmrl: 1,
        };
        assert!(matches!(
            d.start_omega(1, 7, true, Interrupt::None, bad, now, &mut out),
            Err(Error::InvalidQos(_))
        ));
        assert_eq!(d.get_leader(1, 7), Err(Error::NotMember { pid: 1, gid: 7 }));
        assert_eq!(
            d.stop_omega(1, 7, now, &mut out),
            Err(Error::NotMember { pid: 1, gid: 7 })
        );
        assert_eq!(
            d.change_interrupt_mode(1, 7, Interrupt::None),
            Err(Error::NotMember { pid: 1, gid: 7 })
        );
        d.start_omega(1, 7, false, Interrupt::None, qos(), now, &mut out)
            .unwrap();
        assert_eq!(
            d.start_omega(1, 7, false, Interrupt::None, qos(), now, &mut out),
            Err(Error::AlreadyMember { pid: 1, gid: 7 })
        );
    }

    #[test]
    fn interrupt_none_rearms_notification() {
        let mut d = daemon();
        let now = Timestamp::from_units(1001);
        let mut out = vec![];
        d.register(1).unwrap();
        d.register(2).unwrap();
        d.start_omega(1, 7, true, Interrupt::AnyChange, qos(), now, &mut out)
            .unwrap();
        d.start_omega(2, 7, false, Interrupt::AnyChange, qos(), now, &mut out)
            .unwrap();
        d.change_interrupt_mode(2, 7, Interrupt::None).unwrap();
        d.change_interrupt_mode(2, 7, Interrupt::AnyChange).unwrap();
        out.clear();
        d.register(3).unwrap();
        d.start_omega(3, 7, false, Interrupt::None, qos(), now, &mut out)
            .unwrap();
        let notified: Vec<Pid> = out
            .iter()
            .filter_map(|o| match o {
                Output::Leader { to, .. } => Some(*to),
                _ => None,
            })
            .collect();
        assert_eq!(notified, vec![2]);
    }

    #[test]
    fn unregister_hands_leadership_over() {
        let mut d = daemon();
        let now = Timestamp::from_units(1001);
        let mut out = vec![];
        d.register(1).unwrap();
        d.register(2).unwrap();
        d.start_omega(1, 7, true, Interrupt::None, qos(), now, &mut out)
            .unwrap();
        d.start_omega(2, 7, true, Interrupt::AnyChange, qos(), now, &mut out)
            .unwrap();
        out.clear();
        d.unregister(1, now.add_units(5), &mut out).unwrap();
        assert!(!d.locals().contains(1));
        assert!(out.contains(&Output::Alive {
            pid: 2,
            gid: 7,
            sending: true
        }));
        let view = d.get_leader(2, 7).unwrap();
        assert_eq!(view.leader.map(|c| c.pid), Some(2));
        d.unregister(2, now.add_units(6), &mut out).unwrap();
        assert!(!d.locals().has_group(7));
        assert!(!d.election().has_group(7));
    }

    #[test]
    fn hello_is_jittered_then_periodic() {
        let mut d = daemon();
        let start = d.epoch;
        let first = d.scheduler().when(&Event::Hello).unwrap();
        assert!(first >= start && first < start.add_units(500));
        let mut out = vec![];
        d.run_due(first, &mut out);
        assert!(matches!(
            out.as_slice(),
            [Output::Send {
                to: Dest::Multicast,
                msg: Message::Hello(_)
            }]
        ));
        assert_eq!(
            d.scheduler().when(&Event::Hello),
            Some(first.add_units(10_000))
        );
    }

    #[test]
    fn monitoring_unknown_host_starts_handshake() {
        let mut d = daemon();
        let now = Timestamp::from_units(1001);
        let peer = addr("10.0.0.2");
        let mut out = vec![];
        d.register(1).unwrap();
        d.monitor_process(1, peer, 40, qos(), Interrupt::AnyChange, now, &mut out)
            .unwrap();
        assert!(d.host(peer).is_some());
        d.run_due(now, &mut out);
        assert!(out.iter().any(|o| matches!(
            o,
            Output::Send {
                to: Dest::Host(a),
                msg: Message::Handshake(Handshake { seq: 1, finished: false, .. })
            } if *a == peer
        )));
        assert_eq!(
            d.scheduler().when(&Event::Handshake(peer)),
            Some(now.add_units(10))
        );
        d.unmonitor_process(1, peer, 40).unwrap();
        assert_eq!(
            d.unmonitor_process(1, peer, 40),
            Err(Error::NotMonitoring {
                pid: 1,
                addr: peer,
                remote: 40
            })
        );
    }
}
