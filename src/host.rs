// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::cfg::Config;
use crate::stats::Stats;
use crate::time::{Timestamp, Units};
use crate::{Gid, HostAddr, Pid};
use im::{OrdMap, OrdSet as ArcOrdSet};

/// Everything the daemon knows about one peer daemon. Membership lists are
/// persistent sets, so the merge protocol can build replacements on the
/// side and commit them in one assignment.
#[derive(Clone, Debug)]
pub struct RemoteHost {
    pub addr: HostAddr,
    /// The peer's start time; zero until it is first heard from.
    pub remote_epoch: Timestamp,
    pub stats: Stats,

    pub last_report_ts: Timestamp,
    pub next_report_ts: Timestamp,
    /// Sequence of the last report sent to the peer.
    pub local_seq: u32,
    /// Sequence of the last report accepted from the peer.
    pub remote_seq: Option<u32>,
    pub hello_seq: u32,
    pub handshake_seq: u32,
    pub remote_handshake_seq: u32,

    pub remote_servers_seq: Option<u32>,
    pub remote_requests_seq: Option<u32>,
    pub remote_groups_seq: Option<u32>,
    /// Version of the servers list we send this peer.
    pub local_servers_seq: u32,

    /// Local pids the peer asked us to report on.
    pub local_servers: ArcOrdSet<Pid>,
    /// Peer pids it reports alive to us.
    pub remote_servers: ArcOrdSet<Pid>,
    /// Every group the peer has members in, as far as we know.
    pub remote_groups: ArcOrdSet<Gid>,
    /// Groups with members on both sides.
    pub jointly: ArcOrdSet<Gid>,
    /// Visible peer members, per group, from the last accepted report.
    pub group_procs: OrdMap<Gid, ArcOrdSet<Pid>>,

    /// Largest group timestamp received from the peer.
    pub remote_largest_group_ts: Timestamp,
    /// Largest of our group timestamps the peer acknowledged.
    pub acked_group_ts: Timestamp,

    /// Interval we need the peer to report at.
    pub needed_from_remote: Units,
    /// Interval the peer needs from us; our reporting interval towards it.
    pub local_sendint: Units,
    /// Interval the peer announced for its own reports.
    pub remote_sendint: Units,
    /// The peer sent a group section we have not acknowledged yet.
    pub owe_ack: bool,
}

impl RemoteHost {
    pub fn new(addr: HostAddr, epoch: Timestamp, cfg: &Config) -> Self {
        RemoteHost {
            addr,
            remote_epoch: epoch,
            stats: Stats::new(cfg),
            last_report_ts: Timestamp::ZERO,
            next_report_ts: Timestamp::ZERO,
            local_seq: 0,
            remote_seq: None,
            hello_seq: 0,
            handshake_seq: 0,
            remote_handshake_seq: 0,
            remote_servers_seq: None,
            remote_requests_seq: None,
            remote_groups_seq: None,
            local_servers_seq: 0,
            local_servers: ArcOrdSet::new(),
            remote_servers: ArcOrdSet::new(),
            remote_groups: ArcOrdSet::new(),
            jointly: ArcOrdSet::new(),
            group_procs: OrdMap::new(),
            remote_largest_group_ts: Timestamp::ZERO,
            acked_group_ts: Timestamp::ZERO,
            needed_from_remote: cfg.max_sendint,
            local_sendint: cfg.max_sendint,
            remote_sendint: cfg.max_sendint,
            owe_ack: false,
        }
    }

    /// Recomputes the jointly monitored groups against the local group list
    /// and returns the groups that just became joint.
    pub fn rebuild_jointly<F: Fn(Gid) -> bool>(&mut self, local_has: F) -> Vec<Gid> {
        let jointly: ArcOrdSet<Gid> = self
            .remote_groups
            .iter()
            .filter(|g| local_has(**g))
            .cloned()
            .collect();
        let fresh = jointly
            .iter()
            .filter(|g| !self.jointly.contains(*g))
            .cloned()
            .collect();
        self.group_procs = self
            .group_procs
            .iter()
            .filter(|(g, _)| jointly.contains(*g))
            .map(|(g, p)| (*g, p.clone()))
            .collect();
        self.jointly = jointly;
        fresh
    }

    pub fn visible_in(&self, gid: Gid) -> impl Iterator<Item = &Pid> {
        self.group_procs.get(&gid).into_iter().flat_map(|s| s.iter())
    }

    pub fn handshake_done(&self) -> bool {
        self.stats.both_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jointly_tracks_both_sides() {
        let cfg = Config::default();
        let mut h = RemoteHost::new("10.1.1.1".parse().unwrap(), Timestamp::ZERO, &cfg);
        h.remote_groups = vec![1u32, 2, 3].into_iter().collect();
        h.group_procs.insert(3, vec![9u32].into_iter().collect::<ArcOrdSet<Pid>>());
        assert_eq!(h.rebuild_jointly(|g| g != 2), vec![1, 3]);
        assert_eq!(h.rebuild_jointly(|g| g != 2), Vec::<Gid>::new());
        assert_eq!(h.visible_in(3).cloned().collect::<Vec<_>>(), vec![9]);
        assert_eq!(h.rebuild_jointly(|g| g == 1), Vec::<Gid>::new());
        assert!(h.group_procs.get(&3).is_none());
        assert!(!h.handshake_done());
    }
}
