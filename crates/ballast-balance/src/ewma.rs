//! Peak-sensitive EWMA latency metric.
//!
//! One [`EwmaMetric`] tracks a single backend for the peak-EWMA selector.
//! It combines an exponentially weighted moving average of observed RTTs
//! with the count of requests currently pending against that backend; the
//! resulting load score is what power-of-two-choices compares.
//!
//! The EWMA is *peak sensitive*: an RTT above the current average resets
//! the average before folding the sample in, so a latency spike dominates
//! immediately instead of being smoothed away.

/// Default penalty applied while the EWMA is empty but requests are
/// pending: one second, in nanoseconds.
pub const DEFAULT_PENALTY_NS: f64 = 1_000_000_000.0;

/// Peak EWMA state for one backend.
#[derive(Debug, Clone)]
pub struct EwmaMetric {
    /// Timestamp of the last observation or decay, nanoseconds.
    stamp_ns: i64,
    /// Requests currently outstanding against this backend.
    pending: u32,
    /// EWMA of latency in nanoseconds.
    cost_ns: f64,
    /// Decay window in nanoseconds.
    decay_ns: f64,
    /// Cost substituted while the EWMA is zero but work is pending.
    penalty_ns: f64,
}

impl EwmaMetric {
    /// Creates a metric with the given decay window.
    ///
    /// `now_ns` stamps the creation time; `decay_ns` is floored at 1 ns.
    pub fn new(decay_ns: i64, now_ns: i64) -> Self {
        Self {
            stamp_ns: now_ns,
            pending: 0,
            cost_ns: 0.0,
            decay_ns: decay_ns.max(1) as f64,
            penalty_ns: DEFAULT_PENALTY_NS,
        }
    }

    /// Folds one RTT observation into the average.
    ///
    /// An RTT above the current non-zero average resets the average first,
    /// so the spike shows through undamped.
    pub fn observe(&mut self, rtt_ns: i64, now_ns: i64) {
        let tdiff = (now_ns - self.stamp_ns).max(0);
        self.stamp_ns = now_ns;

        if rtt_ns as f64 > self.cost_ns && self.cost_ns > f64::EPSILON {
            self.cost_ns = 0.0;
        }

        let w = (-(tdiff as f64) / self.decay_ns).exp();
        self.cost_ns = self.cost_ns * w + rtt_ns as f64 * (1.0 - w);
    }

    /// Current load score: decayed EWMA scaled by outstanding work.
    ///
    /// With a zero average and pending requests (a fresh backend, or one
    /// whose average was just peak-reset) the score is the penalty plus the
    /// pending count, so idle-looking backends with queued work don't
    /// attract a pile-on. Always non-negative.
    pub fn load(&mut self, now_ns: i64) -> f64 {
        let tdiff = (now_ns - self.stamp_ns).max(0);
        if tdiff > 0 {
            let w = (-(tdiff as f64) / self.decay_ns).exp();
            self.cost_ns *= w;
            self.stamp_ns = now_ns;
        }

        let score = if self.cost_ns <= f64::EPSILON && self.pending > 0 {
            self.penalty_ns + f64::from(self.pending)
        } else {
            self.cost_ns * f64::from(self.pending + 1)
        };
        score.max(0.0)
    }

    pub fn inc_pending(&mut self) {
        self.pending += 1;
    }

    /// Saturates at zero; extra decrements indicate a caller bug.
    pub fn dec_pending(&mut self) {
        if self.pending > 0 {
            self.pending -= 1;
        }
    }

    pub fn pending(&self) -> u32 {
        self.pending
    }

    pub fn cost_ns(&self) -> f64 {
        self.cost_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: i64 = 1_000_000;
    const DECAY: i64 = 10_000 * MS;

    #[test]
    fn test_new_metric_has_zero_load() {
        let mut metric = EwmaMetric::new(DECAY, 0);
        assert_eq!(metric.load(0), 0.0);
    }

    #[test]
    fn test_pending_without_observations_scores_penalty() {
        let mut metric = EwmaMetric::new(DECAY, 0);
        metric.inc_pending();
        let load = metric.load(0);
        assert!(load >= DEFAULT_PENALTY_NS);
    }

    #[test]
    fn test_observation_sets_cost() {
        let mut metric = EwmaMetric::new(DECAY, 0);
        // An observation with no elapsed time carries zero weight.
        metric.observe(5 * MS, 0);
        assert_eq!(metric.cost_ns(), 0.0);
        metric.observe(5 * MS, 1000 * MS);
        assert!(metric.cost_ns() > 0.0);
    }

    #[test]
    fn test_peak_resets_average() {
        let mut metric = EwmaMetric::new(DECAY, 0);
        // Settle the average near 5ms.
        let mut now = 0;
        for _ in 0..50 {
            now += 100 * MS;
            metric.observe(5 * MS, now);
        }
        let settled = metric.cost_ns();
        assert!(settled > 0.0);

        // A 500ms spike must dominate, not be smoothed into the average.
        now += 100 * MS;
        metric.observe(500 * MS, now);
        assert!(metric.cost_ns() > settled);
        assert!(metric.cost_ns() > 400.0 * MS as f64 * (1.0 - (-0.01f64).exp()));
    }

    #[test]
    fn test_load_decays_over_time() {
        let mut metric = EwmaMetric::new(DECAY, 0);
        let mut now = 0;
        for _ in 0..10 {
            now += 100 * MS;
            metric.observe(5 * MS, now);
        }
        let before = metric.load(now);
        let after = metric.load(now + DECAY);
        assert!(after < before);
    }

    #[test]
    fn test_load_scales_with_pending() {
        let mut metric = EwmaMetric::new(DECAY, 0);
        let mut now = 0;
        for _ in 0..10 {
            now += 100 * MS;
            metric.observe(5 * MS, now);
        }
        let idle = metric.load(now);
        metric.inc_pending();
        metric.inc_pending();
        let busy = metric.load(now);
        assert!(busy > idle);
    }

    #[test]
    fn test_dec_pending_saturates() {
        let mut metric = EwmaMetric::new(DECAY, 0);
        metric.dec_pending();
        assert_eq!(metric.pending(), 0);
        metric.inc_pending();
        metric.dec_pending();
        metric.dec_pending();
        assert_eq!(metric.pending(), 0);
    }

    #[test]
    fn test_load_never_negative() {
        let mut metric = EwmaMetric::new(1, 0);
        metric.observe(1, 0);
        assert!(metric.load(i64::MAX / 2) >= 0.0);
    }

    #[test]
    fn test_decay_floor() {
        // A non-positive decay window must not divide by zero.
        let mut metric = EwmaMetric::new(0, 0);
        metric.observe(5 * MS, 10);
        assert!(metric.load(20).is_finite());
    }
}
