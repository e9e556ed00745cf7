// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::error::{Error, Result};
use crate::time::Units;
use serde::{Deserialize, Serialize};

/// `Qos` is the triple of bounds a monitoring process asks for: an upper
/// bound on detection time `tdu`, an upper bound on mistake duration `tmu`,
/// and a lower bound on mistake recurrence time `tmrl`. All three are in
/// `Units`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Qos {
    pub tdu: Units,
    pub tmu: Units,
    pub tmrl: Units,
}

impl Qos {
    pub fn new(tdu: Units, tmu: Units, tmrl: Units) -> Result<Self> {
        if tdu == 0 {
            return Err(Error::InvalidQos("detection time must be positive"));
        }
        if tmu == 0 {
            return Err(Error::InvalidQos("mistake duration must be positive"));
        }
        if tmrl == 0 {
            return Err(Error::InvalidQos("mistake recurrence must be positive"));
        }
        Ok(Qos { tdu, tmu, tmrl })
    }
}

/// `Config` gathers the protocol constants of a daemon. Every field has a
/// default, so a partial JSON document is a valid configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Floor on any sending interval.
    pub min_sendint: Units,
    /// Ceiling on any sending interval; samples sent at this interval or
    /// slower carry no delay information.
    pub max_sendint: Units,
    /// Retransmission period of handshake messages.
    pub handshake_interval: Units,
    /// Delay samples collected by the handshake, and the size of the
    /// sample window afterwards.
    pub max_samples: usize,
    /// Below this many samples the previous delay estimate is kept.
    pub min_samples: usize,
    pub hello_interval: Units,
    pub hello_jitter: Units,
    /// Delay of the next report while the peer has not acknowledged a
    /// group timestamp.
    pub fast_report_delay: Units,
    /// QoS the daemon applies to the host itself; a host that misses this
    /// deadline is considered permanently crashed.
    pub host_qos: Qos,
    pub initial_loss_probability: f64,
    pub max_loss_probability: f64,
    /// Probability that a delayed message is counted lost too early.
    pub loss_accuracy: f64,
    /// A peer interval within this factor of the needed one is left alone.
    pub sendint_tolerance: f64,
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            min_sendint: 5,
            max_sendint: 24 * 3600 * 1000,
            handshake_interval: 10,
            max_samples: 128,
            min_samples: 5,
            hello_interval: 10_000,
            hello_jitter: 500,
            fast_report_delay: 50,
            host_qos: Qos {
                tdu: 600_000,
                tmu: 600_000,
                tmrl: 600_000,
            },
            initial_loss_probability: 0.01,
            max_loss_probability: 0.9,
            loss_accuracy: 0.01,
            sendint_tolerance: 1.25,
            seed: 0,
        }
    }
}

impl Config {
    pub fn from_json(s: &str) -> Result<Self> {
        let cfg: Config = serde_json::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_sendint == 0 || self.min_sendint > self.max_sendint {
            return Err(Error::Config(format!(
                "sending interval bounds {}..{} are empty",
                self.min_sendint, self.max_sendint
            )));
        }
        if self.max_samples < self.min_samples || self.min_samples == 0 {
            return Err(Error::Config("sample window smaller than its cold-start size".into()));
        }
        if !(0.0..1.0).contains(&self.loss_accuracy) || self.loss_accuracy == 0.0 {
            return Err(Error::Config("loss accuracy must lie in (0, 1)".into()));
        }
        if !(0.0..=1.0).contains(&self.max_loss_probability) {
            return Err(Error::Config("max loss probability must lie in [0, 1]".into()));
        }
        Qos::new(self.host_qos.tdu, self.host_qos.tmu, self.host_qos.tmrl)?;
        Ok(())
    }

    /// Lifetime of a remote group learned by hello or report.
    pub fn group_ttl(&self) -> Units {
        2 * std::cmp::max(self.host_qos.tdu, self.hello_interval)
    }
}
