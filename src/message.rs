// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::election::Contender;
use crate::time::{Timestamp, Units};
use crate::{Gid, HostAddr, Pid};
use serde::{Deserialize, Serialize};

/// One jointly monitored group as seen by the sender of a report: the
/// sender's group timestamp, whether the receiver already acknowledged that
/// timestamp, and the sender's visible members.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupSection {
    pub gid: Gid,
    pub ts: Timestamp,
    pub acked: bool,
    pub pids: Vec<Pid>,
}

/// The sender's election variables for a group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElectionVars {
    pub gid: Gid,
    pub accusation_time: Timestamp,
    pub start_time: Timestamp,
    pub leader: Option<Contender>,
}

/// Periodic gossip from one daemon to one peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Report {
    pub sending_ts: Timestamp,
    pub seq: u32,
    /// Sender's epoch.
    pub epoch: Timestamp,
    /// Receiver's epoch as the sender believes it to be.
    pub thought_epoch: Timestamp,
    pub servers_seq: u32,
    pub requests_seq: u32,
    pub groups_seq: u32,
    /// Interval the sender needs the receiver to report at.
    pub needed_sendint: Units,
    /// Interval until the sender's next report.
    pub sendint: Units,
    /// Largest group timestamp the sender has received from the receiver.
    pub largest_group_ts: Timestamp,
    /// Sender's pids the receiver asked for that are alive.
    pub servers: Vec<Pid>,
    /// Receiver's pids that the sender's processes monitor.
    pub requests: Vec<Pid>,
    pub groups: Vec<GroupSection>,
    pub vars: Vec<ElectionVars>,
}

/// Multicast announcement of the sender's groups.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hello {
    pub seq: u32,
    pub groups_seq: u32,
    pub epoch: Timestamp,
    pub groups: Vec<Gid>,
}

/// Delay-sampling message exchanged before reports start.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handshake {
    pub seq: u32,
    pub epoch: Timestamp,
    pub sending_ts: Timestamp,
    /// The sender holds a full sample window.
    pub finished: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Accusation {
    pub gid: Gid,
    /// Start time the accuser recorded for the accused candidacy.
    pub start_time: Timestamp,
}

/// Messages exchanged between daemons. Encoding them onto the wire is left
/// to the driver.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Message {
    Report(Report),
    Hello(Hello),
    Handshake(Handshake),
    Accusation(Accusation),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Report(_) => "report",
            Message::Hello(_) => "hello",
            Message::Handshake(_) => "handshake",
            Message::Accusation(_) => "accusation",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dest {
    Host(HostAddr),
    Multicast,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrustChange {
    Trusted,
    Suspected,
    Crashed,
}

/// A group's leader as reported to local processes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaderView {
    pub leader: Option<Contender>,
    pub stable: bool,
}

/// Effects produced by the daemon for its driver to carry out.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Output {
    Send {
        to: Dest,
        msg: Message,
    },
    /// Point-to-point monitoring notification for local process `to`.
    Trust {
        to: Pid,
        addr: HostAddr,
        pid: Pid,
        change: TrustChange,
    },
    Leader {
        to: Pid,
        gid: Gid,
        view: LeaderView,
    },
    /// Local process `pid` must start or stop sending alives for `gid`.
    Alive {
        pid: Pid,
        gid: Gid,
        sending: bool,
    },
}
