// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Gid, Pid};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("pid 0 is reserved for the daemon")]
    ReservedPid,
    #[error("process {0} is not registered")]
    UnknownProcess(Pid),
    #[error("process {0} is already registered")]
    AlreadyRegistered(Pid),
    #[error("process {pid} is not a member of group {gid}")]
    NotMember { pid: Pid, gid: Gid },
    #[error("process {pid} already joined group {gid}")]
    AlreadyMember { pid: Pid, gid: Gid },
    #[error("process {pid} already monitors {addr}/{remote}")]
    AlreadyMonitoring { pid: Pid, addr: IpAddr, remote: Pid },
    #[error("process {pid} does not monitor {addr}/{remote}")]
    NotMonitoring { pid: Pid, addr: IpAddr, remote: Pid },
    #[error("group {0} has no local members")]
    UnknownGroup(Gid),
    #[error("invalid QoS: {0}")]
    InvalidQos(&'static str),
    #[error("no accusation time known for {addr} in group {gid}")]
    MissingVars { addr: IpAddr, gid: Gid },
    #[error("configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
