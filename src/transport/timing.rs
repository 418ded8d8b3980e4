//! RTT estimation.
//!
//! Implements the RFC 6298 estimator that drives each stream's
//! retransmission timeout.

use std::time::Duration;

use crate::core::{INITIAL_RTO, MAX_RTO, MIN_RTO};

/// RTT timing constants.
pub mod constants {
    /// Alpha for SRTT smoothing (0.125 = 1/8).
    pub const SRTT_ALPHA: f64 = 0.125;

    /// Beta for RTTVAR smoothing (0.25 = 1/4).
    pub const RTTVAR_BETA: f64 = 0.25;

    /// K multiplier for RTO calculation (4.0 per RFC 6298).
    pub const RTO_K: f64 = 4.0;

    /// Clock granularity used in the RTO formula.
    pub const CLOCK_GRANULARITY_MS: f64 = 1.0;
}

/// RTT estimator implementing RFC 6298.
///
/// Maintains smoothed RTT (SRTT) and RTT variance (RTTVAR) and derives an
/// adaptive retransmission timeout clamped to the configured bounds.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// Smoothed RTT in milliseconds.
    srtt: f64,
    /// RTT variance in milliseconds.
    rttvar: f64,
    /// Current retransmission timeout.
    rto: Duration,
    /// Whether we've received the first RTT sample.
    initialized: bool,
    min_rto: Duration,
    max_rto: Duration,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    /// Create a new RTT estimator with the protocol default bounds.
    pub fn new() -> Self {
        Self::with_bounds(INITIAL_RTO, MIN_RTO, MAX_RTO)
    }

    /// Create an estimator with custom initial, minimum and maximum RTO.
    pub fn with_bounds(initial_rto: Duration, min_rto: Duration, max_rto: Duration) -> Self {
        Self {
            srtt: 0.0,
            rttvar: 0.0,
            rto: initial_rto.clamp(min_rto, max_rto),
            initialized: false,
            min_rto,
            max_rto,
        }
    }

    /// Update RTT estimate with a new sample.
    ///
    /// - First measurement: SRTT = sample, RTTVAR = sample / 2
    /// - Subsequent: RTTVAR = 0.75 * RTTVAR + 0.25 * |SRTT - sample|
    /// - SRTT = 0.875 * SRTT + 0.125 * sample
    pub fn update(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;

        if !self.initialized {
            self.srtt = sample_ms;
            self.rttvar = sample_ms / 2.0;
            self.initialized = true;
        } else {
            self.rttvar = (1.0 - constants::RTTVAR_BETA) * self.rttvar
                + constants::RTTVAR_BETA * (self.srtt - sample_ms).abs();
            self.srtt =
                (1.0 - constants::SRTT_ALPHA) * self.srtt + constants::SRTT_ALPHA * sample_ms;
        }

        // RTO = SRTT + max(G, K * RTTVAR)
        let rto_ms =
            self.srtt + f64::max(constants::CLOCK_GRANULARITY_MS, constants::RTO_K * self.rttvar);

        let rto_ms = rto_ms.clamp(
            self.min_rto.as_millis() as f64,
            self.max_rto.as_millis() as f64,
        );

        self.rto = Duration::from_millis(rto_ms as u64);
    }

    /// Get the current smoothed RTT.
    pub fn srtt(&self) -> Duration {
        Duration::from_secs_f64(self.srtt / 1000.0)
    }

    /// Get the current smoothed RTT in milliseconds.
    pub fn srtt_ms(&self) -> f64 {
        self.srtt
    }

    /// Get the current RTT variance.
    pub fn rttvar(&self) -> Duration {
        Duration::from_secs_f64(self.rttvar / 1000.0)
    }

    /// Get the current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Largest timeout backoff may reach.
    pub fn max_rto(&self) -> Duration {
        self.max_rto
    }

    /// Check if the estimator has been initialized with at least one sample.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_estimator_initial() {
        let estimator = RttEstimator::new();
        assert!(!estimator.is_initialized());
        assert_eq!(estimator.rto(), INITIAL_RTO);
    }

    #[test]
    fn test_rtt_estimator_first_sample() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_millis(100));

        assert!(estimator.is_initialized());
        assert!((estimator.srtt_ms() - 100.0).abs() < 0.01);
        assert!((estimator.rttvar - 50.0).abs() < 0.01); // sample / 2
        // 100 + 4 * 50
        assert_eq!(estimator.rto(), Duration::from_millis(300));
    }

    #[test]
    fn test_rtt_estimator_multiple_samples() {
        let mut estimator = RttEstimator::new();

        estimator.update(Duration::from_millis(100));
        let srtt1 = estimator.srtt_ms();

        estimator.update(Duration::from_millis(120));
        let srtt2 = estimator.srtt_ms();

        // SRTT should move toward the new sample
        assert!(srtt2 > srtt1);
        assert!(srtt2 < 120.0);
    }

    #[test]
    fn test_rtt_estimator_min_rto() {
        let mut estimator = RttEstimator::new();

        // Loopback-sized sample
        estimator.update(Duration::from_micros(100));

        assert_eq!(estimator.rto(), MIN_RTO);
    }

    #[test]
    fn test_rtt_estimator_custom_bounds() {
        let mut estimator = RttEstimator::with_bounds(
            Duration::from_millis(50),
            Duration::from_millis(10),
            Duration::from_millis(200),
        );
        assert_eq!(estimator.rto(), Duration::from_millis(50));

        estimator.update(Duration::from_secs(2));
        assert_eq!(estimator.rto(), Duration::from_millis(200));
        assert_eq!(estimator.max_rto(), Duration::from_millis(200));
    }

    #[test]
    fn test_initial_rto_clamped() {
        let estimator = RttEstimator::with_bounds(
            Duration::from_secs(5),
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        assert_eq!(estimator.rto(), Duration::from_secs(1));
    }
}
