// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * This crate implements an adaptive crash-fault failure detector for a set of
 * hosts, each running one daemon on behalf of its local processes, plus an
 * Omega leader-election oracle built on top of it.
 *
 * Local processes subscribe in two ways:
 *
 *   - Point-to-point: "tell me when process P on host H stops being alive",
 *     with a quality-of-service (QoS) triple bounding detection time
 *     (`tdu`), mistake recurrence (`tmu`) and mistake duration (`tmrl`).
 *
 *   - Group: "I am a member (and maybe a candidate) of group G; tell me who
 *     the leader is". Eventually all correct members agree on one correct
 *     candidate.
 *
 * Daemons gossip periodic reports to each other. The receiver estimates the
 * delay, delay variance and loss probability of each link, and picks the
 * slowest reporting interval that still meets every subscriber's QoS; it
 * asks the sender for that interval in its own reports. A process is
 * suspected when the report refreshing it is late past its freshness
 * deadline.
 *
 * The daemon is a sans-I/O state machine: see [`Daemon`]. Time is in
 * microseconds ([`Timestamp`]) with intervals counted in 1ms units.
 *
 * ## Reference
 *
 * Wei Chen, Sam Toueg, Marcos Kawazoe Aguilera. On the Quality of Service
 * of Failure Detectors. IEEE Transactions on Computers 51(5), 2002.
 *
 * Tushar Deepak Chandra, Vassos Hadzilacos, Sam Toueg. The Weakest Failure
 * Detector for Solving Consensus. Journal of the ACM 43(4), 1996.
 *
 * ## Name
 *
 * A vigil is a watch kept through the night: someone stays awake so that
 * the others find out when something happens.
 */

pub mod cfg;
pub mod daemon;
pub mod election;
pub mod error;
pub mod host;
pub mod local;
mod merge;
pub mod message;
pub mod sched;
pub mod stats;
pub mod time;
pub mod wei;


/// Local process identifier. Zero is reserved.
pub type Pid = u32;
/// Group identifier.
pub type Gid = u32;
/// Hosts are named by the address their daemon listens on.
pub type HostAddr = std::net::IpAddr;

pub use cfg::{Config, Qos};
pub use daemon::Daemon;
pub use election::Contender;
pub use error::{Error, Result};
pub use local::{Interrupt, TrustKey};
pub use message::{Dest, LeaderView, Message, Output, TrustChange};
pub use time::{Timestamp, Units};

use tracing_subscriber::EnvFilter;

/// Installs a formatting subscriber filtered by `RUST_LOG`. Drivers call this
/// once at startup; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
