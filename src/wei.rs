// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Chen's configuration procedure for a heartbeat failure detector: given QoS
//! bounds and the current network estimates, find the largest sending
//! interval `η` that keeps the expected mistake recurrence time above `TmrL`
//! while detecting crashes within `Tdu`.

use crate::cfg::Qos;
use crate::stats::Estimates;
use crate::time::Units;

/// Bisection stops once the bracket is narrower than this fraction.
const TOLERANCE: f64 = 0.005;

/// Lower bound on the mistake recurrence time, in units, when heartbeats are
/// sent every `eta` units:
/// `η · Π_{j=1}^{⌈Tdu/η⌉−1} (v_d + (Tdu − jη)²) / (v_d + pl·(Tdu − jη)²)`.
pub fn mistake_recurrence(eta: f64, tdu: f64, v_d: f64, pl: f64) -> f64 {
    if eta <= 0.0 {
        return 0.0;
    }
    let mut prod = eta;
    let n = (tdu / eta).ceil() as u64;
    for j in 1..n {
        let x = tdu - j as f64 * eta;
        let x2 = x * x;
        let den = v_d + pl * x2;
        if den <= 0.0 {
            return f64::INFINITY;
        }
        prod *= (v_d + x2) / den;
        if prod.is_infinite() {
            break;
        }
    }
    prod
}

fn satisfies(eta: f64, tdu: f64, v_d: f64, pl: f64, tmrl: f64) -> bool {
    mistake_recurrence(eta, tdu, v_d, pl) / 1000.0 >= tmrl
}

/// Unclipped solution in fractional units. Returns `min_sendint` whenever the
/// estimates leave no room above it.
pub fn solve(qos: &Qos, est: &Estimates, min_sendint: Units) -> f64 {
    let floor = min_sendint as f64;
    let (v_d, pl) = (est.v_d, est.pl);
    if pl >= 1.0 {
        return floor;
    }
    let tdu = qos.tdu as f64;
    let tmu = qos.tmu as f64;
    let tmrl = qos.tmrl as f64;

    let gamma = (1.0 - pl) * tdu * tdu / (v_d + tdu * tdu);
    let eta_max = (gamma * tmu).min(tdu);
    if eta_max < floor {
        return floor;
    }
    if satisfies(eta_max, tdu, v_d, pl, tmrl) {
        return eta_max;
    }

    let mut lower = eta_max;
    loop {
        lower /= 2.0;
        if lower < floor || satisfies(lower, tdu, v_d, pl, tmrl) {
            break;
        }
    }
    let mut upper = lower * 2.0;
    if upper < floor {
        return floor;
    }
    loop {
        let mid = (lower + upper) / 2.0;
        if satisfies(mid, tdu, v_d, pl, tmrl) {
            lower = mid;
        } else {
            upper = mid;
        }
        if (upper - lower) / upper < TOLERANCE {
            break;
        }
    }
    lower
}

/// Sending interval in whole units, clipped to `[min_sendint, Tdu]`.
pub fn solve_interval(qos: &Qos, est: &Estimates, min_sendint: Units) -> Units {
    let eta = solve(qos, est, min_sendint).floor() as Units;
    eta.min(qos.tdu).max(min_sendint)
}
