// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The gossip protocol between daemons: handshakes that seed the delay
//! estimator, hellos that announce group membership, and reports that carry
//! liveness, membership and election state. Merging a report rebuilds every
//! trust entry held on its sender and commits the result in one pass.

use crate::daemon::Daemon;
use crate::cfg::Qos;
use crate::local::{TrustEntry, TrustKey};
use crate::message::{
    Accusation, Dest, GroupSection, Handshake, Hello, Message, Output, Report, TrustChange,
};
use crate::sched::Event;
use crate::time::{Timestamp, Units};
use crate::wei::solve_interval;
use crate::{Gid, HostAddr, Pid};
use im::OrdSet as ArcOrdSet;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

impl Daemon {
    pub fn merge_handshake(
        &mut self,
        hs: &Handshake,
        from: HostAddr,
        now: Timestamp,
        out: &mut Vec<Output>,
    ) {
        if self.locate_host(from, Some(hs.epoch), now, out).is_none() {
            return;
        }
        if let Some(host) = self.hosts.get_mut(&from) {
            if !host.stats.local_finished {
                host.remote_handshake_seq = hs.seq;
            }
        }
        self.send_handshake(from, Some(hs.finished), now, out);
        if let Some(host) = self.hosts.get_mut(&from) {
            if !host.stats.local_finished {
                host.stats.record_handshake_sample(hs.sending_ts, now);
            }
        }
        self.settle(now, out);
    }

    /// Advances the handshake with `addr`: notes whether the peer holds a
    /// full window, finishes once both sides do, and otherwise sends another
    /// handshake message.
    pub(crate) fn send_handshake(
        &mut self,
        addr: HostAddr,
        remote_finished: Option<bool>,
        now: Timestamp,
        out: &mut Vec<Output>,
    ) {
        let epoch = self.epoch;
        let host = match self.hosts.get_mut(&addr) {
            Some(h) => h,
            None => return,
        };
        let mut flipped = false;
        if remote_finished == Some(true) && !host.stats.remote_finished {
            host.stats.remote_finished = true;
            flipped = true;
        }
        if !host.stats.local_finished && host.stats.handshake_complete() {
            host.stats.local_finished = true;
            flipped = true;
        }
        if host.stats.both_finished() {
            if flipped {
                self.finish_handshake(addr, now);
            }
            return;
        }
        host.handshake_seq = host.handshake_seq.wrapping_add(1);
        out.push(Output::Send {
            to: Dest::Host(addr),
            msg: Message::Handshake(Handshake {
                seq: host.handshake_seq,
                epoch,
                sending_ts: now,
                finished: host.stats.local_finished,
            }),
        });
        self.sched.schedule(
            Event::Handshake(addr),
            now.add_units(self.cfg.handshake_interval),
        );
    }

    fn finish_handshake(&mut self, addr: HostAddr, now: Timestamp) {
        if let Some(host) = self.hosts.get_mut(&addr) {
            let seq = host.remote_handshake_seq;
            host.stats.finish_handshake(seq);
            debug!(
                "peer {} finished handshake with {}: e_d {:.3} pl {:.4}",
                self.addr, addr, host.stats.est.e_d, host.stats.est.pl
            );
        }
        self.sched.cancel(&Event::Handshake(addr));
        self.recalc_sendint(addr);
        self.report_now(addr, now);
    }

    pub fn merge_hello(&mut self, h: &Hello, from: HostAddr, now: Timestamp, out: &mut Vec<Output>) {
        let created = match self.locate_host(from, Some(h.epoch), now, out) {
            Some(c) => c,
            None => return,
        };
        let ttl = self.cfg.group_ttl();
        let locals = &self.locals;
        let host = match self.hosts.get_mut(&from) {
            Some(h) => h,
            None => return,
        };
        if !created && h.seq <= host.hello_seq {
            trace!("peer {} ignoring old hello {} from {}", self.addr, h.seq, from);
            return;
        }
        host.hello_seq = h.seq;
        let announced: ArcOrdSet<Gid> = h.groups.iter().cloned().collect();
        for gid in host.remote_groups.iter().filter(|g| !announced.contains(*g)) {
            self.sched.cancel(&Event::SuspectGroup(from, *gid));
        }
        for gid in announced.iter() {
            self.sched
                .schedule(Event::SuspectGroup(from, *gid), now.add_units(ttl));
        }
        host.remote_groups = announced;
        host.remote_groups_seq = Some(h.groups_seq);
        let fresh = host.rebuild_jointly(|g| locals.has_group(g));
        let answer = (created && !host.jointly.is_empty()) || !fresh.is_empty();
        let done = host.handshake_done();

        if answer {
            let at = now.add_units(self.jitter());
            self.sched.schedule_by(Event::Hello, at);
        }
        if !fresh.is_empty() && done {
            self.report_now(from, now);
        }
        self.recalc_sendint(from);
        self.settle(now, out);
    }

    pub fn merge_accusation(
        &mut self,
        acc: &Accusation,
        from: HostAddr,
        now: Timestamp,
        out: &mut Vec<Output>,
    ) {
        trace!("peer {} accused by {} in group {}", self.addr, from, acc.gid);
        self.election.on_accusation(acc, now, out);
        self.settle(now, out);
    }

    /// Merges a report from `from`. Reports from a stale incarnation on
    /// either side, and reports older than the last one accepted, are
    /// dropped without effect.
    pub fn merge_report(&mut self, r: &Report, from: HostAddr, now: Timestamp, out: &mut Vec<Output>) {
        if r.thought_epoch < self.epoch {
            trace!("peer {} dropping report meant for an older epoch", self.addr);
            return;
        }
        let created = match self.locate_host(from, Some(r.epoch), now, out) {
            Some(c) => c,
            None => return,
        };
        let host = match self.hosts.get_mut(&from) {
            Some(h) => h,
            None => return,
        };
        if created || !host.stats.local_finished {
            trace!("peer {} report from {} during handshake", self.addr, from);
            return;
        }
        if let Some(last) = host.remote_seq {
            if r.seq <= last {
                trace!("peer {} dropping report {} <= {} from {}", self.addr, r.seq, last, from);
                return;
            }
        }
        if !host.stats.remote_finished {
            self.finish_handshake(from, now);
        }
        let (touched, new_joint) = self.adopt_report(r, from, now);
        self.commit_trust(from, now, out);
        for gid in touched {
            self.election.recompute(gid, now, out);
        }
        self.adjust_reporting(r, from, !new_joint.is_empty(), now);
        self.settle(now, out);
    }

    /// Copies the report's sequence numbers, membership lists, group
    /// sections and election variables into the host record. Returns the
    /// election groups it touched and the groups that became joint.
    fn adopt_report(&mut self, r: &Report, from: HostAddr, now: Timestamp) -> (BTreeSet<Gid>, Vec<Gid>) {
        let ttl = self.cfg.group_ttl();
        let locals = &self.locals;
        let mut touched = BTreeSet::new();
        let host = match self.hosts.get_mut(&from) {
            Some(h) => h,
            None => return (touched, vec![]),
        };
        host.remote_seq = Some(r.seq);
        host.stats.observe(r.seq, r.sending_ts, now, r.sendint);
        host.remote_sendint = r.sendint;

        if host.remote_servers_seq != Some(r.servers_seq) {
            host.remote_servers = r.servers.iter().cloned().collect();
            host.remote_servers_seq = Some(r.servers_seq);
        }
        if host.remote_requests_seq != Some(r.requests_seq) {
            let requested: ArcOrdSet<Pid> = r.requests.iter().cloned().collect();
            if requested != host.local_servers {
                host.local_servers = requested;
                host.local_servers_seq = host.local_servers_seq.wrapping_add(1);
            }
            host.remote_requests_seq = Some(r.requests_seq);
        }
        if r.largest_group_ts > host.acked_group_ts {
            host.acked_group_ts = r.largest_group_ts;
        }

        let mut procs = im::OrdMap::new();
        for sec in r.groups.iter() {
            host.remote_groups.insert(sec.gid);
            self.sched
                .schedule(Event::SuspectGroup(from, sec.gid), now.add_units(ttl));
            if sec.ts > host.remote_largest_group_ts {
                host.remote_largest_group_ts = sec.ts;
            }
            // The ack only steers the sender's fast reporting; members are
            // taken from every section.
            if !sec.acked {
                host.owe_ack = true;
            }
            let pids: ArcOrdSet<Pid> = sec.pids.iter().cloned().collect();
            procs.insert(sec.gid, pids);
        }
        host.remote_groups_seq = Some(r.groups_seq);
        host.group_procs = procs;
        let new_joint = host.rebuild_jointly(|g| locals.has_group(g));

        let visible: Vec<(Gid, Pid)> = host
            .group_procs
            .iter()
            .flat_map(|(g, ps)| ps.iter().map(move |p| (*g, *p)))
            .collect();
        for (gid, pid) in visible {
            if self.election.add_remote_contender(gid, from, pid) {
                touched.insert(gid);
            }
        }
        for v in r.vars.iter() {
            if self.election.store_remote_vars(from, v) {
                touched.insert(v.gid);
            }
        }
        (touched, new_joint)
    }

    /// Rebuilds the trust entries every local process holds on `from` from
    /// the freshly merged host record, then commits the difference: lost
    /// entries are reported crashed, new ones trusted, and every surviving
    /// entry gets a new freshness deadline.
    fn commit_trust(&mut self, from: HostAddr, now: Timestamp, out: &mut Vec<Output>) {
        let min = self.cfg.min_sendint;
        let host_qos = self.cfg.host_qos;
        let host = match self.hosts.get(&from) {
            Some(h) => h,
            None => return,
        };
        // Without an arrival estimate the deadlines run from now; the next
        // report brings one.
        let expected = host.stats.expected_arrival().unwrap_or(now);
        let est = host.stats.est;
        let deadline = |qos: &Qos| -> Timestamp {
            let eta = solve_interval(qos, &est, min);
            expected.add_units(qos.tdu.saturating_sub(eta))
        };

        let mut built: BTreeMap<Pid, BTreeMap<TrustKey, Timestamp>> = BTreeMap::new();
        for p in self.locals.procs() {
            let entries = built.entry(p.pid).or_default();
            for (rpid, mon) in p.monitors_on(from) {
                if host.remote_servers.contains(&rpid) {
                    let key = TrustKey {
                        addr: from,
                        pid: rpid,
                        gid: None,
                    };
                    entries.insert(key, deadline(&mon.qos));
                }
            }
            for (gid, m) in p.groups.iter() {
                if !host.jointly.contains(gid) {
                    continue;
                }
                let fresh = deadline(&m.qos);
                for rpid in host.visible_in(*gid) {
                    let key = TrustKey {
                        addr: from,
                        pid: *rpid,
                        gid: Some(*gid),
                    };
                    entries.insert(key, fresh);
                }
            }
        }
        let host_deadline = deadline(&host_qos);

        let mut lost = vec![];
        let mut gained = vec![];
        for p in self.locals.procs_mut() {
            let fresh = built.remove(&p.pid).unwrap_or_default();
            let stale: Vec<TrustKey> = p
                .trusted_on(from)
                .map(|(k, _)| *k)
                .filter(|k| !fresh.contains_key(k))
                .collect();
            for k in stale {
                p.trusted.remove(&k);
                self.sched.cancel(&Event::Suspect(p.pid, k));
                lost.push((p.pid, k));
            }
            for (k, until) in fresh {
                self.sched.schedule(Event::Suspect(p.pid, k), until);
                let prev = p.trusted.insert(
                    k,
                    TrustEntry { fresh_until: until },
                );
                if prev.is_none() {
                    gained.push((p.pid, k));
                }
            }
        }
        self.sched.schedule(Event::SuspectHost(from), host_deadline);

        for (pid, k) in lost {
            trace!("process {} no longer trusts {:?}", pid, k);
            self.trust_lost(pid, k, TrustChange::Crashed, now, out);
        }
        for (pid, k) in gained.into_iter().filter(|(_, k)| k.gid.is_none()) {
            self.notify_trust(pid, k, TrustChange::Trusted, out);
        }
    }

    /// Takes the peer's requested interval, recomputes ours, and decides
    /// when the next report to `from` goes out.
    fn adjust_reporting(&mut self, r: &Report, from: HostAddr, new_joint: bool, now: Timestamp) {
        let (min, max) = (self.cfg.min_sendint, self.cfg.max_sendint);
        let need_changed = self.recalc_sendint(from);
        let host = match self.hosts.get_mut(&from) {
            Some(h) => h,
            None => return,
        };
        let old = host.local_sendint;
        host.local_sendint = r.needed_sendint.max(min).min(max);
        if host.owe_ack || new_joint || need_changed {
            self.report_now(from, now);
        } else {
            if host.local_sendint < old {
                let sooner = host.last_report_ts.add_units(host.local_sendint);
                if sooner < host.next_report_ts {
                    host.next_report_ts = std::cmp::max(sooner, now);
                }
            }
            self.schedule_report(from, now);
        }
    }

    /// Recomputes the interval we need `addr` to report at: the tightest
    /// of the host liveness QoS, the QoS of every monitor on that host, and
    /// the QoS of every local member of a group where the host has visible
    /// members. Returns whether the peer should hear about it now.
    pub(crate) fn recalc_sendint(&mut self, addr: HostAddr) -> bool {
        let (min, max, tol) = (
            self.cfg.min_sendint,
            self.cfg.max_sendint,
            self.cfg.sendint_tolerance,
        );
        let host = match self.hosts.get(&addr) {
            Some(h) if h.handshake_done() => h,
            _ => return false,
        };
        let est = host.stats.est;
        let mut need = solve_interval(&self.cfg.host_qos, &est, min);
        for p in self.locals.procs() {
            for (_, mon) in p.monitors_on(addr) {
                need = need.min(solve_interval(&mon.qos, &est, min));
            }
            for (gid, m) in p.groups.iter() {
                if host.jointly.contains(gid) && host.visible_in(*gid).next().is_some() {
                    need = need.min(solve_interval(&m.qos, &est, min));
                }
            }
        }
        let need: Units = need.max(min).min(max);
        let host = match self.hosts.get_mut(&addr) {
            Some(h) => h,
            None => return false,
        };
        if need == host.needed_from_remote {
            return false;
        }
        trace!(
            "peer {} needs {} to report every {} (was {})",
            self.addr,
            addr,
            need,
            host.needed_from_remote
        );
        host.needed_from_remote = need;
        let remote = host.remote_sendint as f64;
        (need as f64) < remote || (need as f64) > tol * remote
    }

    pub(crate) fn report_now(&mut self, addr: HostAddr, now: Timestamp) {
        if let Some(host) = self.hosts.get_mut(&addr) {
            host.next_report_ts = now;
        }
        self.schedule_report(addr, now);
    }

    /// (Re)schedules the report to `addr` at its next due time, or sooner
    /// while the peer has not acknowledged our latest group timestamp.
    pub(crate) fn schedule_report(&mut self, addr: HostAddr, now: Timestamp) {
        let host = match self.hosts.get(&addr) {
            Some(h) if h.handshake_done() => h,
            _ => return,
        };
        let largest = host
            .jointly
            .iter()
            .filter_map(|g| self.locals.group_ts(*g))
            .max()
            .unwrap_or(Timestamp::ZERO);
        let at = if largest > host.acked_group_ts {
            std::cmp::min(now.add_units(self.cfg.fast_report_delay), host.next_report_ts)
        } else {
            host.next_report_ts
        };
        self.sched.schedule(Event::Report(addr), at);
    }

    pub(crate) fn send_report(&mut self, addr: HostAddr, now: Timestamp, out: &mut Vec<Output>) {
        let epoch = self.epoch;
        let host = match self.hosts.get_mut(&addr) {
            Some(h) if h.handshake_done() => h,
            _ => return,
        };
        host.local_seq = host.local_seq.wrapping_add(1);
        host.owe_ack = false;
        host.last_report_ts = now;
        host.next_report_ts = now.add_units(host.local_sendint);
        let host_next = host.next_report_ts;

        let locals = &self.locals;
        let election = &self.election;
        let groups: Vec<GroupSection> = host
            .jointly
            .iter()
            .map(|gid| {
                let ts = locals.group_ts(*gid).unwrap_or(Timestamp::ZERO);
                GroupSection {
                    gid: *gid,
                    ts,
                    acked: host.acked_group_ts >= ts,
                    pids: locals.visible_pids(*gid),
                }
            })
            .collect();
        let vars = host
            .jointly
            .iter()
            .filter_map(|gid| election.local_vars(*gid))
            .collect();
        let servers = host
            .local_servers
            .iter()
            .filter(|p| locals.contains(**p))
            .cloned()
            .collect();
        let mut report = Report {
            sending_ts: now,
            seq: host.local_seq,
            epoch,
            thought_epoch: host.remote_epoch,
            servers_seq: host.local_servers_seq,
            requests_seq: locals.requests_seq,
            groups_seq: locals.groups_seq,
            needed_sendint: host.needed_from_remote,
            sendint: host.local_sendint,
            largest_group_ts: host.remote_largest_group_ts,
            servers,
            requests: locals.requested_from(addr).into_iter().collect(),
            groups,
            vars,
        };
        // The peer extrapolates our next report from the interval announced
        // here, so it may come sooner but never later.
        self.schedule_report(addr, now);
        let due = self.sched.when(&Event::Report(addr)).unwrap_or(host_next);
        report.sendint = due.units_since(now).max(1);
        if let Some(host) = self.hosts.get_mut(&addr) {
            host.next_report_ts = now.add_units(report.sendint);
        }
        trace!(
            "peer {} report {} to {}: groups [{}]",
            self.addr,
            report.seq,
            addr,
            report.groups.iter().map(|s| s.gid).join(", ")
        );
        out.push(Output::Send {
            to: Dest::Host(addr),
            msg: Message::Report(report),
        });
    }

    pub(crate) fn send_hello(&mut self, out: &mut Vec<Output>) {
        self.hello_seq = self.hello_seq.wrapping_add(1);
        let hello = Hello {
            seq: self.hello_seq,
            groups_seq: self.locals.groups_seq,
            epoch: self.epoch,
            groups: self.locals.group_ids().into_iter().collect(),
        };
        trace!("peer {} hello {} with {} groups", self.addr, hello.seq, hello.groups.len());
        out.push(Output::Send {
            to: Dest::Multicast,
            msg: Message::Hello(hello),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::Config;
    use crate::election::Contender;
    use crate::local::Interrupt;
    use crate::message::ElectionVars;

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

    const PEER_EPOCH: u64 = 500;

    struct Rig {
        d: Daemon,
        peer: HostAddr,
        now: Timestamp,
        seq: u32,
        out: Vec<Output>,
    }

    impl Rig {
        fn new() -> Self {
            let d = Daemon::new(addr("10.0.0.1"), Timestamp::from_units(1000), Config::default())
                .unwrap();
            Rig {
                d,
                peer: addr("10.0.0.2"),
                now: Timestamp::from_units(1001),
                seq: 0,
                out: vec![],
            }
        }

        fn tick(&mut self, units: Units) {
            self.now = self.now.add_units(units);
            self.d.run_due(self.now, &mut self.out);
        }

        /// Plays the peer's side of a handshake with fixed one-unit delay.
        fn handshake(&mut self) {
            for seq in 1..=140 {
                let hs = Handshake {
                    seq,
                    epoch: Timestamp::from_units(PEER_EPOCH),
                    sending_ts: self.now.sub_units(1),
                    finished: true,
                };
                self.d.merge_handshake(&hs, self.peer, self.now, &mut self.out);
                self.tick(1);
                if self.d.host(self.peer).unwrap().handshake_done() {
                    break;
                }
            }
            assert!(self.d.host(self.peer).unwrap().handshake_done());
        }

        fn report(&mut self, groups: Vec<GroupSection>, vars: Vec<ElectionVars>) -> Report {
            self.seq += 1;
            Report {
                sending_ts: self.now.sub_units(1),
                seq: self.seq,
                epoch: Timestamp::from_units(PEER_EPOCH),
                thought_epoch: self.d.epoch,
                servers_seq: 0,
                requests_seq: 0,
                groups_seq: 0,
                needed_sendint: 500,
                sendint: 500,
                largest_group_ts: Timestamp::ZERO,
                servers: vec![],
                requests: vec![],
                groups,
                vars,
            }
        }

        fn sent_reports(&self) -> Vec<&Report> {
            self.out
                .iter()
                .filter_map(|o| match o {
                    Output::Send {
                        msg: Message::Report(r),
                        ..
                    } => Some(r),
                    _ => None,
                })
                .collect()
        }
    }

    fn section(gid: Gid, pids: Vec<Pid>, acked: bool) -> GroupSection {
        GroupSection {
            gid,
            ts: Timestamp::from_units(PEER_EPOCH + 1),
            acked,
            pids,
        }
    }

    fn vars(gid: Gid, start: Timestamp) -> ElectionVars {
        ElectionVars {
            gid,
            accusation_time: Timestamp::from_units(PEER_EPOCH),
            start_time: start,
            leader: None,
        }
    }

    #[test]
    fn handshake_then_first_report() {
        let _ = pretty_env_logger::try_init();
        let mut rig = Rig::new();
        rig.handshake();
        let host = rig.d.host(rig.peer).unwrap();
        assert!(host.needed_from_remote < rig.d.cfg.max_sendint);
        assert!(!rig.d.scheduler().is_pending(&Event::Handshake(rig.peer)));
        rig.tick(1);
        let reports = rig.sent_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].thought_epoch, Timestamp::from_units(PEER_EPOCH));
        assert_eq!(reports[0].needed_sendint, host_needed(&rig));
    }

    fn host_needed(rig: &Rig) -> Units {
        rig.d.host(rig.peer).unwrap().needed_from_remote
    }

    #[test]
    fn reports_during_handshake_or_out_of_order_are_dropped() {
        let mut rig = Rig::new();
        let early = rig.report(vec![], vec![]);
        rig.d.merge_report(&early, rig.peer, rig.now, &mut rig.out);
        assert_eq!(rig.d.host(rig.peer).unwrap().remote_seq, None);

        rig.handshake();
        let r1 = rig.report(vec![], vec![]);
        let r2 = rig.report(vec![], vec![]);
        rig.d.merge_report(&r2, rig.peer, rig.now, &mut rig.out);
        assert_eq!(rig.d.host(rig.peer).unwrap().remote_seq, Some(r2.seq));
        rig.d.merge_report(&r1, rig.peer, rig.now, &mut rig.out);
        assert_eq!(rig.d.host(rig.peer).unwrap().remote_seq, Some(r2.seq));

        let mut stale = rig.report(vec![], vec![]);
        stale.thought_epoch = Timestamp::from_units(1);
        rig.d.merge_report(&stale, rig.peer, rig.now, &mut rig.out);
        assert_eq!(rig.d.host(rig.peer).unwrap().remote_seq, Some(r2.seq));
    }

    #[test]
    fn visible_peer_leads_and_is_accused_when_silent() {
        let mut rig = Rig::new();
        rig.d.register(1).unwrap();
        rig.d
            .start_omega(1, 7, false, Interrupt::AnyChange, qos(), rig.now, &mut rig.out)
            .unwrap();
        rig.handshake();

        let start = Timestamp::from_units(PEER_EPOCH + 1);
        let r = rig.report(vec![section(7, vec![20], true)], vec![vars(7, start)]);
        rig.d.merge_report(&r, rig.peer, rig.now, &mut rig.out);
        let key = TrustKey {
            addr: rig.peer,
            pid: 20,
            gid: Some(7),
        };
        assert_eq!(rig.d.trusted(1), vec![key]);
        let view = rig.d.get_leader(1, 7).unwrap();
        assert_eq!(view.leader, Some(Contender { addr: rig.peer, pid: 20 }));
        assert!(view.stable);

        // The peer goes silent past the detection deadline.
        let deadline = rig.d.scheduler().when(&Event::Suspect(1, key)).unwrap();
        assert!(deadline > rig.now);
        assert!(deadline <= rig.now.add_units(500 + 2000));
        rig.out.clear();
        let wait = deadline.units_since(rig.now);
        rig.tick(wait);
        assert!(rig.d.trusted(1).is_empty());
        assert!(rig.out.contains(&Output::Send {
            to: Dest::Host(rig.peer),
            msg: Message::Accusation(Accusation { gid: 7, start_time: start }),
        }));
        assert_eq!(rig.d.get_leader(1, 7).unwrap().leader, None);
    }

    #[test]
    fn unacked_sections_are_acknowledged_promptly() {
        let mut rig = Rig::new();
        rig.d.register(1).unwrap();
        rig.d
            .start_omega(1, 7, false, Interrupt::None, qos(), rig.now, &mut rig.out)
            .unwrap();
        rig.handshake();
        rig.tick(1);
        rig.out.clear();

        let r = rig.report(vec![section(7, vec![20], false)], vec![vars(7, Timestamp::ZERO)]);
        rig.d.merge_report(&r, rig.peer, rig.now, &mut rig.out);
        // Members are adopted before the section is acknowledged.
        assert_eq!(rig.d.trusted(1).len(), 1);
        assert_eq!(rig.d.get_leader(1, 7).unwrap().leader, Some(Contender { addr: rig.peer, pid: 20 }));
        assert!(rig.d.host(rig.peer).unwrap().owe_ack);
        assert_eq!(rig.d.scheduler().when(&Event::Report(rig.peer)), Some(rig.now));
        rig.tick(0);
        let sent = rig.sent_reports();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].largest_group_ts, Timestamp::from_units(PEER_EPOCH + 1));
        assert!(!rig.d.host(rig.peer).unwrap().owe_ack);
    }

    fn member_rig() -> Rig {
        let mut rig = Rig::new();
        rig.d.register(1).unwrap();
        rig.d
            .start_omega(1, 7, false, Interrupt::None, qos(), rig.now, &mut rig.out)
            .unwrap();
        rig.handshake();
        rig
    }

    #[test]
    fn deadlines_stay_within_tdu_of_the_last_report() {
        let mut rig = member_rig();
        let key = TrustKey {
            addr: rig.peer,
            pid: 20,
            gid: Some(7),
        };
        for _ in 0..6 {
            let r = rig.report(vec![section(7, vec![20], true)], vec![vars(7, Timestamp::ZERO)]);
            rig.d.merge_report(&r, rig.peer, rig.now, &mut rig.out);
            let suspect = rig.d.scheduler().when(&Event::Suspect(1, key)).unwrap();
            assert!(suspect > rig.now);
            assert!(suspect <= rig.now.add_units(qos().tdu));
            let host_tdu = rig.d.cfg.host_qos.tdu;
            let forget = rig.d.scheduler().when(&Event::SuspectHost(rig.peer)).unwrap();
            assert!(forget <= rig.now.add_units(host_tdu));
            rig.tick(500);
        }
    }

    #[test]
    fn first_report_at_max_sendint_still_bounds_detection() {
        let mut rig = member_rig();
        let mut r = rig.report(vec![section(7, vec![20], true)], vec![vars(7, Timestamp::ZERO)]);
        r.sendint = rig.d.cfg.max_sendint;
        rig.d.merge_report(&r, rig.peer, rig.now, &mut rig.out);
        let key = TrustKey {
            addr: rig.peer,
            pid: 20,
            gid: Some(7),
        };
        let suspect = rig.d.scheduler().when(&Event::Suspect(1, key)).unwrap();
        assert!(suspect <= rig.now.add_units(qos().tdu));
        let forget = rig.d.scheduler().when(&Event::SuspectHost(rig.peer)).unwrap();
        assert!(forget <= rig.now.add_units(rig.d.cfg.host_qos.tdu));
    }

    #[test]
    fn reports_never_come_later_than_announced() {
        let mut rig = Rig::new();
        rig.d.register(1).unwrap();
        rig.d
            .start_omega(1, 7, true, Interrupt::None, qos(), rig.now, &mut rig.out)
            .unwrap();
        rig.handshake();
        let r = rig.report(vec![section(7, vec![], true)], vec![]);
        rig.d.merge_report(&r, rig.peer, rig.now, &mut rig.out);
        // Our group timestamp is unacknowledged: fast reports.
        for _ in 0..300 {
            rig.tick(1);
        }
        let mut ack = rig.report(vec![section(7, vec![], true)], vec![]);
        ack.largest_group_ts = rig.d.locals().group_ts(7).unwrap();
        rig.d.merge_report(&ack, rig.peer, rig.now, &mut rig.out);
        for _ in 0..2_000 {
            rig.tick(1);
        }

        let sent = rig.sent_reports();
        assert!(sent.iter().any(|r| r.sendint == rig.d.cfg.fast_report_delay));
        assert!(sent.iter().any(|r| r.sendint == 500));
        for pair in sent.windows(2) {
            assert!(pair[1].sending_ts <= pair[0].sending_ts.add_units(pair[0].sendint));
        }
    }

    #[test]
    fn delivery_order_does_not_change_committed_state() {
        let mut rigs = vec![Rig::new(), Rig::new()];
        for rig in rigs.iter_mut() {
            rig.d.register(1).unwrap();
            rig.d
                .start_omega(1, 7, false, Interrupt::None, qos(), rig.now, &mut rig.out)
                .unwrap();
            rig.handshake();
        }
        let r1 = rigs[0].report(vec![section(7, vec![20], true)], vec![vars(7, Timestamp::ZERO)]);
        let r2 = rigs[0].report(vec![section(7, vec![20, 21], true)], vec![vars(7, Timestamp::ZERO)]);
        for (rig, order) in rigs.iter_mut().zip(vec![vec![&r1, &r2], vec![&r2, &r1]]) {
            for r in order {
                rig.d.merge_report(r, rig.peer, rig.now, &mut rig.out);
            }
        }
        let (a, b) = (&rigs[0].d, &rigs[1].d);
        assert_eq!(a.trusted(1), b.trusted(1));
        assert_eq!(a.trusted(1).len(), 2);
        assert_eq!(a.host(rigs[0].peer).unwrap().remote_seq, Some(r2.seq));
        assert_eq!(b.host(rigs[1].peer).unwrap().remote_seq, Some(r2.seq));
        assert_eq!(a.get_leader(1, 7).unwrap(), b.get_leader(1, 7).unwrap());
    }

    #[test]
    fn restarted_peer_is_torn_down() {
        let mut rig = Rig::new();
        rig.d.register(1).unwrap();
        rig.d
            .start_omega(1, 7, false, Interrupt::None, qos(), rig.now, &mut rig.out)
            .unwrap();
        rig.handshake();
        let r = rig.report(vec![section(7, vec![20], true)], vec![vars(7, Timestamp::ZERO)]);
        rig.d.merge_report(&r, rig.peer, rig.now, &mut rig.out);
        assert_eq!(rig.d.trusted(1).len(), 1);

        let hello = Hello {
            seq: 1,
            groups_seq: 0,
            epoch: Timestamp::from_units(PEER_EPOCH + 5000),
            groups: vec![7],
        };
        rig.d.merge_hello(&hello, rig.peer, rig.now, &mut rig.out);
        assert!(rig.d.trusted(1).is_empty());
        let host = rig.d.host(rig.peer).unwrap();
        assert_eq!(host.remote_epoch, hello.epoch);
        assert_eq!(host.remote_seq, None);
        assert!(!host.handshake_done());
        let peer = rig.peer;
        assert_eq!(
            rig.d
                .scheduler()
                .count_where(|e| matches!(e, Event::Suspect(..) | Event::Report(_)) && e.host() == Some(peer)),
            0
        );
        assert!(rig.d.scheduler().is_pending(&Event::Handshake(peer)));

        // Messages from the earlier incarnation are ignored.
        let mut old = rig.report(vec![], vec![]);
        old.seq = 1000;
        rig.d.merge_report(&old, rig.peer, rig.now, &mut rig.out);
        assert_eq!(rig.d.host(rig.peer).unwrap().remote_seq, None);
    }

    #[test]
    fn point_to_point_trust_follows_servers_list() {
        let mut rig = Rig::new();
        rig.d.register(1).unwrap();
        rig.d
            .monitor_process(1, rig.peer, 40, qos(), Interrupt::AnyChange, rig.now, &mut rig.out)
            .unwrap();
        rig.handshake();
        rig.out.clear();

        let mut r = rig.report(vec![], vec![]);
        r.servers_seq = 1;
        r.servers = vec![40];
        rig.d.merge_report(&r, rig.peer, rig.now, &mut rig.out);
        let trust = Output::Trust {
            to: 1,
            addr: rig.peer,
            pid: 40,
            change: TrustChange::Trusted,
        };
        assert!(rig.out.contains(&trust));

        rig.out.clear();
        let mut r = rig.report(vec![], vec![]);
        r.servers_seq = 2;
        rig.d.merge_report(&r, rig.peer, rig.now, &mut rig.out);
        assert!(rig.out.contains(&Output::Trust {
            to: 1,
            addr: rig.peer,
            pid: 40,
            change: TrustChange::Crashed,
        }));
        assert!(rig.d.trusted(1).is_empty());
    }

    #[test]
    fn hello_creates_host_and_answers_shared_groups() {
        let mut rig = Rig::new();
        rig.d.register(1).unwrap();
        rig.d
            .start_omega(1, 7, true, Interrupt::None, qos(), rig.now, &mut rig.out)
            .unwrap();
        let hello = Hello {
            seq: 3,
            groups_seq: 1,
            epoch: Timestamp::from_units(PEER_EPOCH),
            groups: vec![7, 8],
        };
        rig.d.merge_hello(&hello, rig.peer, rig.now, &mut rig.out);
        let host = rig.d.host(rig.peer).unwrap();
        assert_eq!(host.jointly.iter().cloned().collect::<Vec<_>>(), vec![7]);
        assert_eq!(host.remote_groups.len(), 2);
        let hello_at = rig.d.scheduler().when(&Event::Hello).unwrap();
        assert!(hello_at < rig.now.add_units(rig.d.cfg.hello_jitter));
        assert!(rig
            .d
            .scheduler()
            .is_pending(&Event::SuspectGroup(rig.peer, 8)));

        // Replays are ignored; a newer hello drops groups it no longer lists.
        rig.d.merge_hello(&hello, rig.peer, rig.now, &mut rig.out);
        let newer = Hello {
            seq: 4,
            groups: vec![8],
            ..hello
        };
        rig.d.merge_hello(&newer, rig.peer, rig.now, &mut rig.out);
        let host = rig.d.host(rig.peer).unwrap();
        assert!(host.jointly.is_empty());
        assert!(!rig
            .d
            .scheduler()
            .is_pending(&Event::SuspectGroup(rig.peer, 7)));
    }
}
