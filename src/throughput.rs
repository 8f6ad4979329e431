use std::time::Instant;

const MIN_ELAPSED_SECS: f64 = 0.001;

/// Turns cumulative kilobit counters into an instantaneous kbps rate.
#[derive(Debug, Default, Clone)]
pub struct ThroughputSampler {
    baseline: Option<(f64, Instant)>,
}

impl ThroughputSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// First sample after a reset, or a counter that went backwards, reports 0.
    pub fn sample(&mut self, cumulative_kbits: f64, at: Instant) -> f64 {
        let speed = match self.baseline {
            None => 0.0,
            Some((previous, since)) => {
                let elapsed = at
                    .saturating_duration_since(since)
                    .as_secs_f64()
                    .max(MIN_ELAPSED_SECS);
                (cumulative_kbits - previous).max(0.0) / elapsed
            }
        };
        self.baseline = Some((cumulative_kbits, at));
        speed
    }

    pub fn reset(&mut self) {
        self.baseline = None;
    }

    pub fn has_baseline(&self) -> bool {
        self.baseline.is_some()
    }
}

pub fn bytes_to_kbits(bytes: u64) -> f64 {
    bytes as f64 * 8.0 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_sample_is_zero() {
        let mut sampler = ThroughputSampler::new();
        assert_eq!(sampler.sample(5_000.0, Instant::now()), 0.0);
        assert!(sampler.has_baseline());
    }

    #[test]
    fn test_rate_proportional_to_delta() {
        let mut sampler = ThroughputSampler::new();
        let start = Instant::now();
        sampler.sample(100.0, start);
        let rate = sampler.sample(300.0, start + Duration::from_secs(2));
        assert!((rate - 100.0).abs() < 1e-9);
        let rate = sampler.sample(700.0, start + Duration::from_secs(4));
        assert!((rate - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_decreasing_counter_clamps_to_zero() {
        let mut sampler = ThroughputSampler::new();
        let start = Instant::now();
        sampler.sample(900.0, start);
        let rate = sampler.sample(10.0, start + Duration::from_secs(1));
        assert_eq!(rate, 0.0);
        // the lower value becomes the new baseline
        let rate = sampler.sample(20.0, start + Duration::from_secs(2));
        assert!((rate - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_elapsed_uses_floor() {
        let mut sampler = ThroughputSampler::new();
        let at = Instant::now();
        sampler.sample(0.0, at);
        let rate = sampler.sample(1.0, at);
        assert!((rate - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_reset_drops_baseline() {
        let mut sampler = ThroughputSampler::new();
        let start = Instant::now();
        sampler.sample(10.0, start);
        sampler.reset();
        assert!(!sampler.has_baseline());
        assert_eq!(sampler.sample(500.0, start + Duration::from_secs(1)), 0.0);
    }

    #[test]
    fn test_bytes_to_kbits() {
        assert_eq!(bytes_to_kbits(1000), 8.0);
        assert_eq!(bytes_to_kbits(0), 0.0);
    }
}
