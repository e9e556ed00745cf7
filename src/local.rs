// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Local processes registered with the daemon: the groups they joined, the
//! remote processes they monitor point-to-point, and the trust entries those
//! subscriptions produce.

use crate::cfg::Qos;
use crate::error::{Error, Result};
use crate::time::Timestamp;
use crate::{Gid, HostAddr, Pid};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interrupt {
    None,
    AnyChange,
}

/// Identity of a monitored remote process. `gid` is `None` for
/// point-to-point monitoring.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrustKey {
    pub addr: HostAddr,
    pub pid: Pid,
    pub gid: Option<Gid>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrustEntry {
    pub fresh_until: Timestamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Membership {
    pub qos: Qos,
    /// Visible members appear in reports; candidates stay invisible until
    /// they lead.
    pub visible: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Monitor {
    pub qos: Qos,
    pub interrupt: Interrupt,
}

#[derive(Clone, Debug)]
pub struct LocalProc {
    pub pid: Pid,
    pub groups: BTreeMap<Gid, Membership>,
    pub monitors: BTreeMap<(HostAddr, Pid), Monitor>,
    pub trusted: BTreeMap<TrustKey, TrustEntry>,
}

impl LocalProc {
    fn new(pid: Pid) -> Self {
        LocalProc {
            pid,
            groups: BTreeMap::new(),
            monitors: BTreeMap::new(),
            trusted: BTreeMap::new(),
        }
    }

    pub fn trusted_on(&self, addr: HostAddr) -> impl Iterator<Item = (&TrustKey, &TrustEntry)> {
        self.trusted.iter().filter(move |(k, _)| k.addr == addr)
    }

    pub fn monitors_on(&self, addr: HostAddr) -> impl Iterator<Item = (Pid, &Monitor)> {
        self.monitors
            .iter()
            .filter(move |((a, _), _)| *a == addr)
            .map(|((_, p), m)| (*p, m))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalGroup {
    /// Last time a member joined or started sending alives.
    pub ts: Timestamp,
}

/// Registry of local processes and the groups they form.
#[derive(Clone, Debug, Default)]
pub struct Locals {
    procs: BTreeMap<Pid, LocalProc>,
    groups: BTreeMap<Gid, LocalGroup>,
    /// Bumped whenever the local group list or a group's visible members
    /// change.
    pub groups_seq: u32,
    /// Bumped whenever the set of monitored remote pids changes.
    pub requests_seq: u32,
}

impl Locals {
    pub fn register(&mut self, pid: Pid) -> Result<()> {
        if pid == 0 {
            return Err(Error::ReservedPid);
        }
        if self.procs.contains_key(&pid) {
            return Err(Error::AlreadyRegistered(pid));
        }
        debug!("registered local process {}", pid);
        self.procs.insert(pid, LocalProc::new(pid));
        Ok(())
    }

    /// Removes `pid`; the caller must already have left its groups and
    /// dropped its monitors.
    pub fn remove(&mut self, pid: Pid) -> Result<LocalProc> {
        self.procs.remove(&pid).ok_or(Error::UnknownProcess(pid))
    }

    pub fn get(&self, pid: Pid) -> Result<&LocalProc> {
        self.procs.get(&pid).ok_or(Error::UnknownProcess(pid))
    }

    pub fn get_mut(&mut self, pid: Pid) -> Result<&mut LocalProc> {
        self.procs.get_mut(&pid).ok_or(Error::UnknownProcess(pid))
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.procs.contains_key(&pid)
    }

    pub fn procs(&self) -> impl Iterator<Item = &LocalProc> {
        self.procs.values()
    }

    pub fn procs_mut(&mut self) -> impl Iterator<Item = &mut LocalProc> {
        self.procs.values_mut()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.procs.keys().cloned().collect()
    }

    /// Adds `pid` to `gid` as an invisible member. Returns whether the group
    /// is new on this host.
    pub fn join(&mut self, pid: Pid, gid: Gid, qos: Qos, now: Timestamp) -> Result<bool> {
        let p = self.procs.get_mut(&pid).ok_or(Error::UnknownProcess(pid))?;
        if p.groups.contains_key(&gid) {
            return Err(Error::AlreadyMember { pid, gid });
        }
        p.groups.insert(
            gid,
            Membership {
                qos,
                visible: false,
            },
        );
        let fresh = !self.groups.contains_key(&gid);
        if fresh {
            self.groups.insert(gid, LocalGroup { ts: now });
            self.groups_seq = self.groups_seq.wrapping_add(1);
        }
        Ok(fresh)
    }

    /// Removes `pid` from `gid`. Returns the old membership and whether the
    /// group no longer has any local member.
    pub fn leave(&mut self, pid: Pid, gid: Gid) -> Result<(Membership, bool)> {
        let p = self.procs.get_mut(&pid).ok_or(Error::UnknownProcess(pid))?;
        let m = p.groups.remove(&gid).ok_or(Error::NotMember { pid, gid })?;
        p.trusted.retain(|k, _| k.gid != Some(gid));
        let empty = !self.procs.values().any(|p| p.groups.contains_key(&gid));
        if empty {
            self.groups.remove(&gid);
        }
        if empty || m.visible {
            self.groups_seq = self.groups_seq.wrapping_add(1);
        }
        Ok((m, empty))
    }

    /// Makes `pid` visible or invisible in `gid`. Becoming visible bumps the
    /// group timestamp. Returns whether anything changed.
    pub fn set_visible(&mut self, pid: Pid, gid: Gid, visible: bool, now: Timestamp) -> bool {
        let m = match self.procs.get_mut(&pid).and_then(|p| p.groups.get_mut(&gid)) {
            Some(m) => m,
            None => return false,
        };
        if m.visible == visible {
            return false;
        }
        m.visible = visible;
        if visible {
            if let Some(g) = self.groups.get_mut(&gid) {
                g.ts = now;
            }
        }
        self.groups_seq = self.groups_seq.wrapping_add(1);
        true
    }

    pub fn has_group(&self, gid: Gid) -> bool {
        self.groups.contains_key(&gid)
    }

    pub fn group_ids(&self) -> BTreeSet<Gid> {
        self.groups.keys().cloned().collect()
    }

    pub fn group_ts(&self, gid: Gid) -> Option<Timestamp> {
        self.groups.get(&gid).map(|g| g.ts)
    }

    pub fn visible_pids(&self, gid: Gid) -> Vec<Pid> {
        self.procs
            .values()
            .filter(|p| p.groups.get(&gid).map_or(false, |m| m.visible))
            .map(|p| p.pid)
            .collect()
    }

    pub fn members(&self, gid: Gid) -> impl Iterator<Item = (Pid, &Membership)> {
        self.procs
            .values()
            .filter_map(move |p| p.groups.get(&gid).map(|m| (p.pid, m)))
    }

    pub fn add_monitor(&mut self, pid: Pid, addr: HostAddr, remote: Pid, mon: Monitor) -> Result<()> {
        let p = self.procs.get_mut(&pid).ok_or(Error::UnknownProcess(pid))?;
        if p.monitors.contains_key(&(addr, remote)) {
            return Err(Error::AlreadyMonitoring { pid, addr, remote });
        }
        p.monitors.insert((addr, remote), mon);
        self.requests_seq = self.requests_seq.wrapping_add(1);
        Ok(())
    }

    /// Drops the monitor and its trust entry, returning the entry if one was
    /// held.
    pub fn remove_monitor(
        &mut self,
        pid: Pid,
        addr: HostAddr,
        remote: Pid,
    ) -> Result<Option<TrustKey>> {
        let p = self.procs.get_mut(&pid).ok_or(Error::UnknownProcess(pid))?;
        if p.monitors.remove(&(addr, remote)).is_none() {
            return Err(Error::NotMonitoring { pid, addr, remote });
        }
        self.requests_seq = self.requests_seq.wrapping_add(1);
        let key = TrustKey {
            addr,
            pid: remote,
            gid: None,
        };
        Ok(p.trusted.remove(&key).map(|_| key))
    }

    /// Remote pids on `addr` that some local process monitors.
    pub fn requested_from(&self, addr: HostAddr) -> BTreeSet<Pid> {
        self.procs
            .values()
            .flat_map(|p| p.monitors_on(addr).map(|(r, _)| r))
            .collect()
    }
}
