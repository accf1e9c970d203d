//! Feedback-driven adaptive chunk sizing
//!
//! A pure control loop: latency observations are folded into an
//! exponentially smoothed estimate, and chunk size is adjusted only when
//! the estimate leaves a hysteresis band around the latency target. Every
//! adjustment starts a cooldown during which the size is frozen, so the
//! loop cannot oscillate on noisy feedback.
//!
//! The sizer is owned by exactly one sequential pipeline run and holds no
//! lock.

use crate::error::{CoreError, Result};
use std::time::Duration;

/// Queue utilization above which upward size adjustments are suppressed
const UTILIZATION_CEILING: f64 = 0.8;

/// Configuration for [`AdaptiveChunkSizer`]
#[derive(Debug, Clone)]
pub struct SizerConfig {
    /// Smallest chunk size in bytes
    pub min_size: usize,
    /// Largest chunk size in bytes
    pub max_size: usize,
    /// Latency target per chunk in milliseconds
    pub target_latency_ms: f64,
    /// Smoothing factor for the latency estimate, in (0, 1]
    pub alpha: f64,
    /// Half-width of the dead band around the target, as a fraction
    pub hysteresis: f64,
    /// Number of feedback calls the size is frozen after an adjustment
    pub cooldown_chunks: u32,
    /// Relative size change per adjustment, as a fraction
    pub step_pct: f64,
}

impl Default for SizerConfig {
    fn default() -> Self {
        Self {
            min_size: 4 * 1024,
            max_size: 256 * 1024,
            target_latency_ms: 600.0,
            alpha: 0.3,
            hysteresis: 0.2,
            cooldown_chunks: 3,
            step_pct: 0.25,
        }
    }
}

impl SizerConfig {
    /// Validate all parameters
    pub fn validate(&self) -> Result<()> {
        if self.min_size == 0 {
            return Err(CoreError::InvalidConfig {
                reason: "min_size must be greater than 0".to_string(),
            });
        }
        if self.max_size < self.min_size {
            return Err(CoreError::InvalidConfig {
                reason: "max_size must be at least min_size".to_string(),
            });
        }
        if self.target_latency_ms <= 0.0 {
            return Err(CoreError::InvalidConfig {
                reason: "target_latency_ms must be positive".to_string(),
            });
        }
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(CoreError::InvalidConfig {
                reason: "alpha must be in (0, 1]".to_string(),
            });
        }
        if self.hysteresis < 0.0 {
            return Err(CoreError::InvalidConfig {
                reason: "hysteresis must not be negative".to_string(),
            });
        }
        if self.step_pct <= 0.0 {
            return Err(CoreError::InvalidConfig {
                reason: "step_pct must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Adaptive chunk size controller
#[derive(Debug)]
pub struct AdaptiveChunkSizer {
    config: SizerConfig,
    current_size: Option<usize>,
    cooldown_remaining: u32,
    smoothed_latency_ms: Option<f64>,
    queue_utilization: f64,
    throughput_bytes_per_sec: Option<f64>,
}

impl AdaptiveChunkSizer {
    /// Create a sizer, rejecting invalid configurations
    pub fn new(config: SizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            current_size: None,
            cooldown_remaining: 0,
            smoothed_latency_ms: None,
            queue_utilization: 0.0,
            throughput_bytes_per_sec: None,
        })
    }

    /// Fold one chunk's observations into the controller state
    ///
    /// `queue_utilization` is clamped into [0, 1]; `model_throughput` is an
    /// optional bytes-per-second ceiling observed at the backend.
    pub fn update_feedback(
        &mut self,
        _last_chunk_size: usize,
        observed_latency: Duration,
        queue_utilization: f64,
        model_throughput: Option<f64>,
    ) {
        let observed_ms = observed_latency.as_secs_f64() * 1000.0;
        self.smoothed_latency_ms = Some(match self.smoothed_latency_ms {
            Some(previous) => self.config.alpha * observed_ms + (1.0 - self.config.alpha) * previous,
            None => observed_ms,
        });
        self.queue_utilization = queue_utilization.clamp(0.0, 1.0);
        if model_throughput.is_some() {
            self.throughput_bytes_per_sec = model_throughput;
        }
        self.cooldown_remaining = self.cooldown_remaining.saturating_sub(1);
    }

    /// Recommend the size for the next chunk
    ///
    /// Holds the current size during cooldown or before the first latency
    /// sample; otherwise steps the size when the smoothed latency leaves
    /// the hysteresis band. The result is always within `[min, max]`.
    pub fn get_next_size(&mut self, default: usize) -> usize {
        let current = match self.current_size {
            Some(size) => size,
            None => {
                let clamped = default.clamp(self.config.min_size, self.config.max_size);
                self.current_size = Some(clamped);
                return clamped;
            }
        };

        if self.cooldown_remaining > 0 {
            return current;
        }
        let Some(smoothed) = self.smoothed_latency_ms else {
            return current;
        };

        let target = self.config.target_latency_ms;
        let upper = target * (1.0 + self.config.hysteresis);
        let lower = target * (1.0 - self.config.hysteresis);

        let mut candidate = if smoothed > upper {
            current as f64 * (1.0 - self.config.step_pct)
        } else if smoothed < lower && self.queue_utilization < UTILIZATION_CEILING {
            current as f64 * (1.0 + self.config.step_pct)
        } else {
            return current;
        };

        if let Some(throughput) = self.throughput_bytes_per_sec {
            candidate = candidate.min(throughput * target / 1000.0);
        }

        let next = (candidate.round() as usize).clamp(self.config.min_size, self.config.max_size);
        if next != current {
            self.current_size = Some(next);
            self.cooldown_remaining = self.config.cooldown_chunks;
            tracing::debug!(
                from = current,
                to = next,
                smoothed_ms = smoothed,
                "chunk size adjusted"
            );
        }
        next
    }

    /// Current size, once initialized
    pub fn current_size(&self) -> Option<usize> {
        self.current_size
    }

    /// Smoothed latency estimate in milliseconds, once a sample exists
    pub fn smoothed_latency_ms(&self) -> Option<f64> {
        self.smoothed_latency_ms
    }

    /// Remaining cooldown feedback calls
    pub fn cooldown_remaining(&self) -> u32 {
        self.cooldown_remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizer(cooldown: u32) -> AdaptiveChunkSizer {
        AdaptiveChunkSizer::new(SizerConfig {
            min_size: 1_000,
            max_size: 100_000,
            target_latency_ms: 600.0,
            alpha: 1.0, // no smoothing lag in tests
            hysteresis: 0.2,
            cooldown_chunks: cooldown,
            step_pct: 0.25,
        })
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        for config in [
            SizerConfig {
                min_size: 0,
                ..Default::default()
            },
            SizerConfig {
                max_size: 1,
                min_size: 2,
                ..Default::default()
            },
            SizerConfig {
                target_latency_ms: 0.0,
                ..Default::default()
            },
            SizerConfig {
                alpha: 1.5,
                ..Default::default()
            },
            SizerConfig {
                alpha: 0.0,
                ..Default::default()
            },
            SizerConfig {
                hysteresis: -0.1,
                ..Default::default()
            },
            SizerConfig {
                step_pct: 0.0,
                ..Default::default()
            },
        ] {
            assert!(AdaptiveChunkSizer::new(config).is_err());
        }
    }

    #[test]
    fn test_first_call_clamps_default() {
        let mut sizer = sizer(3);
        assert_eq!(sizer.get_next_size(500), 1_000);
        assert_eq!(sizer.current_size(), Some(1_000));

        let mut sizer = AdaptiveChunkSizer::new(SizerConfig::default()).unwrap();
        assert_eq!(sizer.get_next_size(10 * 1024 * 1024), SizerConfig::default().max_size);
    }

    #[test]
    fn test_holds_without_latency_sample() {
        let mut sizer = sizer(3);
        let size = sizer.get_next_size(10_000);
        assert_eq!(sizer.get_next_size(10_000), size);
    }

    #[test]
    fn test_high_latency_shrinks_within_band_holds() {
        let mut sizer = sizer(0);
        let initial = sizer.get_next_size(10_000);

        // Inside the [480, 720] band: no action
        sizer.update_feedback(initial, Duration::from_millis(650), 0.1, None);
        assert_eq!(sizer.get_next_size(10_000), initial);

        // Above the band: shrink by step_pct
        sizer.update_feedback(initial, Duration::from_millis(900), 0.1, None);
        assert_eq!(sizer.get_next_size(10_000), 7_500);
    }

    #[test]
    fn test_low_latency_grows_unless_queue_busy() {
        let mut sizer = sizer(0);
        let initial = sizer.get_next_size(10_000);

        // Below the band but queue saturated: hold
        sizer.update_feedback(initial, Duration::from_millis(100), 0.95, None);
        assert_eq!(sizer.get_next_size(10_000), initial);

        // Below the band with an idle queue: grow
        sizer.update_feedback(initial, Duration::from_millis(100), 0.1, None);
        assert_eq!(sizer.get_next_size(10_000), 12_500);
    }

    #[test]
    fn test_cooldown_freezes_size_after_adjustment() {
        let mut sizer = sizer(3);
        let initial = sizer.get_next_size(10_000);

        sizer.update_feedback(initial, Duration::from_millis(900), 0.1, None);
        let shrunk = sizer.get_next_size(10_000);
        assert_eq!(shrunk, 7_500);
        assert_eq!(sizer.cooldown_remaining(), 3);

        // While the cooldown drains, high latency must not trigger another step
        sizer.update_feedback(shrunk, Duration::from_millis(900), 0.1, None);
        assert_eq!(sizer.get_next_size(10_000), shrunk);
        sizer.update_feedback(shrunk, Duration::from_millis(900), 0.1, None);
        assert_eq!(sizer.get_next_size(10_000), shrunk);

        // Cooldown exhausted: the controller may act again
        sizer.update_feedback(shrunk, Duration::from_millis(900), 0.1, None);
        assert_eq!(sizer.get_next_size(10_000), 5_625);
    }

    #[test]
    fn test_throughput_ceiling_caps_growth() {
        let mut sizer = sizer(0);
        let initial = sizer.get_next_size(10_000);

        // Ceiling: 18_000 bytes/s at a 600ms target allows 10_800 bytes
        sizer.update_feedback(initial, Duration::from_millis(100), 0.1, Some(18_000.0));
        assert_eq!(sizer.get_next_size(10_000), 10_800);
    }

    #[test]
    fn test_output_always_within_bounds() {
        let mut sizer = sizer(0);
        let mut size = sizer.get_next_size(99_000);
        for _ in 0..50 {
            sizer.update_feedback(size, Duration::from_millis(50), 0.0, None);
            size = sizer.get_next_size(99_000);
            assert!(size <= 100_000);
        }
        assert_eq!(size, 100_000);

        for _ in 0..80 {
            sizer.update_feedback(size, Duration::from_millis(5_000), 0.0, None);
            size = sizer.get_next_size(99_000);
            assert!(size >= 1_000);
        }
        assert_eq!(size, 1_000);
    }
}
