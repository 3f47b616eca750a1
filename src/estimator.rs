//! DHT size estimation.
//!
//! If `N` node ids are spread uniformly over the 160-bit space, the `i`-th
//! closest id to any point sits at a distance of about `i * 2^160 / N`. Fitting
//! that line through the distances of the local node's closest contacts gives
//! a local estimate; estimates reported by peers in `Pong` messages are
//! averaged in to smooth out local bias.

use std::collections::VecDeque;

use crate::identity::{Contact, NodeId};

/// Remote estimates kept for averaging.
pub const REMOTE_WINDOW: usize = 10;

/// 2^160 as a float.
const ID_SPACE: f64 = 1_461_501_637_330_902_918_203_684_832_716_283_019_655_932_542_976.0;

#[derive(Debug)]
pub struct SizeEstimator {
    local: u64,
    remote: VecDeque<u64>,
}

impl Default for SizeEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl SizeEstimator {
    pub fn new() -> Self {
        Self {
            local: 0,
            remote: VecDeque::with_capacity(REMOTE_WINDOW),
        }
    }

    /// Recompute the local estimate from the contacts closest to `local_id`.
    pub fn update_local(&mut self, local_id: &NodeId, closest: &[Contact]) -> u64 {
        let distances: Vec<f64> = closest
            .iter()
            .map(|c| c.node_id.xor_distance(local_id).as_f64())
            .collect();
        self.local = estimate_from_distances(&distances);
        self.local
    }

    pub fn add_remote(&mut self, estimate: u64) {
        if estimate == 0 {
            return;
        }
        if self.remote.len() == REMOTE_WINDOW {
            self.remote.pop_front();
        }
        self.remote.push_back(estimate);
    }

    /// Mean of the local estimate and every remote estimate in the window.
    pub fn estimate(&self) -> u64 {
        let samples = self.remote.len() as u64 + u64::from(self.local > 0);
        if samples == 0 {
            return 0;
        }
        let total: u128 = self.remote.iter().map(|s| u128::from(*s)).sum::<u128>()
            + u128::from(self.local);
        (total / u128::from(samples)) as u64
    }
}

/// Least-squares fit of `d_i = i * s` over distances sorted ascending; the
/// network size is `2^160 / s`. The result never undercounts the nodes we can
/// see (plus ourselves).
pub fn estimate_from_distances(distances: &[f64]) -> u64 {
    if distances.is_empty() {
        return 0;
    }
    let mut sorted = distances.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let (mut weighted, mut squares) = (0.0f64, 0.0f64);
    for (i, d) in sorted.iter().enumerate() {
        let x = (i + 1) as f64;
        weighted += x * d;
        squares += x * x;
    }
    let floor = distances.len() as u64 + 1;
    if weighted <= 0.0 {
        return floor;
    }
    let slope = weighted / squares;
    let estimate = ID_SPACE / slope;
    if estimate.is_finite() && estimate < u64::MAX as f64 {
        (estimate as u64).max(floor)
    } else {
        u64::MAX
    }
}
