// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Per-peer network statistics: a bounded window of delay samples, an
//! interval-based loss estimator, and the expected arrival time of the next
//! message. Every `RemoteHost` owns exactly one `Stats`.

use crate::cfg::Config;
use crate::time::{micros_to_units_f64, units_to_micros, Timestamp, Units};
use std::collections::BTreeMap;
use tracing::trace;

/// Network estimates consumed by the interval solver. `e_d` is in units,
/// `v_d` in units squared, `pl` a probability.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Estimates {
    pub e_d: f64,
    pub v_d: f64,
    pub pl: f64,
}

#[derive(Clone, Debug)]
struct DelaySample {
    delay_us: i64,
    remote_sendint: Units,
    sending: Timestamp,
}

#[derive(Clone, Debug)]
pub struct Stats {
    pub est: Estimates,

    // Delay window keyed by sequence number.
    window: BTreeMap<u32, DelaySample>,
    // Arrivals not yet fed to the loss estimator, keyed by sequence number.
    pending: BTreeMap<u32, Timestamp>,
    lost: u32,
    total: u32,
    last_interval: u32,
    current_interval: u32,
    last_loss_seq: Option<u32>,
    expected_arrival: Option<Timestamp>,

    pub local_finished: bool,
    pub remote_finished: bool,
    handshake_samples: u32,

    max_samples: usize,
    min_samples: usize,
    max_sendint: Units,
    max_loss: f64,
    loss_accuracy: f64,
}

impl Stats {
    pub fn new(cfg: &Config) -> Self {
        let pl = cfg.initial_loss_probability;
        Stats {
            est: Estimates {
                e_d: 0.0,
                v_d: 0.0,
                pl,
            },
            window: BTreeMap::new(),
            pending: BTreeMap::new(),
            lost: 0,
            total: 0,
            last_interval: interval_length(pl),
            current_interval: 0,
            last_loss_seq: None,
            expected_arrival: None,
            local_finished: false,
            remote_finished: false,
            handshake_samples: 0,
            max_samples: cfg.max_samples,
            min_samples: cfg.min_samples,
            max_sendint: cfg.max_sendint,
            max_loss: cfg.max_loss_probability,
            loss_accuracy: cfg.loss_accuracy,
        }
    }

    pub fn estimated_delay(&self) -> f64 {
        self.est.e_d
    }

    pub fn delay_variation(&self) -> f64 {
        self.est.v_d
    }

    pub fn loss_probability(&self) -> f64 {
        self.est.pl
    }

    pub fn expected_arrival(&self) -> Option<Timestamp> {
        self.expected_arrival
    }

    pub fn samples(&self) -> usize {
        self.window.len()
    }

    pub fn both_finished(&self) -> bool {
        self.local_finished && self.remote_finished
    }

    pub fn handshake_complete(&self) -> bool {
        self.window.len() >= self.max_samples
    }

    /// Inserts a delay sample, evicting the oldest sequence numbers beyond
    /// the window bound, and recomputes the delay estimates and the expected
    /// arrival time. Samples sent at `max_sendint` or slower are ignored.
    pub fn record_sample(
        &mut self,
        seq: u32,
        sending: Timestamp,
        arrival: Timestamp,
        remote_sendint: Units,
    ) {
        if remote_sendint >= self.max_sendint {
            return;
        }
        self.window.insert(
            seq,
            DelaySample {
                delay_us: arrival.delta(sending),
                remote_sendint,
                sending,
            },
        );
        while self.window.len() > self.max_samples {
            self.window.pop_first();
        }
        self.recompute_delays();
        self.recompute_expected_arrival();
    }

    fn recompute_delays(&mut self) {
        let n = self.window.len();
        if n < self.min_samples {
            return;
        }
        let delays = self
            .window
            .values()
            .map(|s| micros_to_units_f64(s.delay_us));
        let mean = delays.clone().sum::<f64>() / n as f64;
        let var = delays.map(|d| (d - mean) * (d - mean)).sum::<f64>() / n as f64;
        self.est.e_d = mean;
        self.est.v_d = var;
    }

    // Clocks are not synchronised, but sending timestamps all come from the
    // peer's clock: the next message leaves at most the announced interval
    // after the newest one, and arrives after the mean observed offset.
    fn recompute_expected_arrival(&mut self) {
        let n = self.window.len() as i64;
        let newest = match self.window.values().next_back() {
            Some(s) => s,
            None => return,
        };
        let offset = self.window.values().map(|s| s.delay_us).sum::<i64>() / n;
        let next = newest
            .sending
            .add_micros(units_to_micros(newest.remote_sendint));
        self.expected_arrival = Some(next.offset(offset));
    }

    /// Feeds the arrival of `seq` to the loss estimator, following the
    /// previously processed `prev_seq`. A gap ends the current virtual loss
    /// interval; without a gap the interval grows until it reaches the
    /// previous one, after which the estimate decays towards
    /// `(lost+1)/(total+1)`.
    pub fn record_loss(&mut self, seq: u32, prev_seq: u32) {
        let inc = seq.wrapping_sub(prev_seq);
        if self.total.checked_add(inc).is_none() {
            self.total /= 2;
            self.lost /= 2;
        }
        self.lost = self.lost.saturating_add(inc.saturating_sub(1));
        self.total = self.total.saturating_add(inc);

        if inc != 1 {
            let denom = self.total.saturating_sub(1);
            if denom > 0 {
                self.est.pl = self.lost as f64 / denom as f64;
            }
            self.last_interval = interval_length(self.est.pl);
            self.current_interval = 1;
        } else {
            self.current_interval = self.current_interval.saturating_add(1);
            if self.current_interval >= self.last_interval {
                let pl = self.lost.saturating_add(1) as f64 / self.total.saturating_add(1) as f64;
                self.est.pl = pl.min(self.max_loss);
            }
        }
        trace!(
            "loss seq #{} after #{}: lost {} of {}, pl {:.4}",
            seq,
            prev_seq,
            self.lost,
            self.total,
            self.est.pl
        );
    }

    /// Records an accepted report: delay sample, pending arrival, and late
    /// loss processing up to `arrival`.
    pub fn observe(
        &mut self,
        seq: u32,
        sending: Timestamp,
        arrival: Timestamp,
        remote_sendint: Units,
    ) {
        if self.last_loss_seq.is_none() {
            self.last_loss_seq = Some(seq.wrapping_sub(1));
        }
        self.record_sample(seq, sending, arrival, remote_sendint);
        self.pending.insert(seq, arrival);
        self.process_late(arrival);
    }

    /// Feeds pending arrivals to the loss estimator in sequence order, once
    /// they are old enough that a reordered predecessor would have arrived
    /// with high probability.
    pub fn process_late(&mut self, now: Timestamp) {
        let hold = (self.est.v_d * (1.0 / self.loss_accuracy - 1.0)).sqrt().round();
        let limit = now.sub_units(hold as Units);
        while let Some((&seq, &arrival)) = self.pending.iter().next() {
            if arrival > limit {
                break;
            }
            self.pending.remove(&seq);
            match self.last_loss_seq {
                Some(last) if seq < last => {
                    // Counted lost earlier, arrived after all.
                    self.lost = self.lost.saturating_sub(1);
                }
                Some(last) if seq == last => {}
                Some(last) => {
                    self.record_loss(seq, last);
                    self.last_loss_seq = Some(seq);
                }
                None => self.last_loss_seq = Some(seq),
            }
        }
    }

    /// Adds a handshake sample. Handshake messages carry no useful sequence
    /// number for the window, so a local counter orders them.
    pub fn record_handshake_sample(&mut self, sending: Timestamp, arrival: Timestamp) {
        self.handshake_samples = self.handshake_samples.wrapping_add(1);
        self.record_sample(self.handshake_samples, sending, arrival, 0);
    }

    /// Ends the handshake: the delay estimate comes from the handshake
    /// window, and the loss probability from how many handshake messages the
    /// peer needed to send for us to collect a full window.
    pub fn finish_handshake(&mut self, remote_handshake_seq: u32) {
        self.remote_finished = true;
        self.local_finished = true;
        self.recompute_delays();
        let floor = 1.0 / self.max_samples as f64;
        let pl = if remote_handshake_seq == 0 {
            floor
        } else {
            1.0 - self.max_samples as f64 / remote_handshake_seq as f64
        };
        self.est.pl = pl.max(floor);
        self.last_interval = interval_length(self.est.pl);
        self.window.clear();
        self.expected_arrival = None;
        trace!(
            "handshake finished: e_d {:.3} v_d {:.3} pl {:.4}",
            self.est.e_d,
            self.est.v_d,
            self.est.pl
        );
    }
}

fn interval_length(pl: f64) -> u32 {
    if pl > 0.0 {
        (1.0 / pl).round() as u32
    } else {
        0
    }
}
