//! Pipeline configuration

use crate::chunker::ChunkerConfig;
use crate::error::{EngineError, Result};
use lintra_core::SizerConfig;
use std::time::Duration;

/// Configuration for [`crate::StreamingPipeline`]
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Documents smaller than this are not streamed
    pub streaming_threshold: usize,
    /// Chunking parameters
    pub chunker: ChunkerConfig,
    /// Process chunks on a worker pool instead of sequentially
    pub parallel: bool,
    /// Worker thread count; `None` uses the number of CPUs
    pub worker_threads: Option<usize>,
    /// Maximum chunks being processed at once
    pub max_concurrent_chunks: usize,
    /// Extra submissions allowed beyond the concurrency cap
    pub max_queue_size: usize,
    /// When disabled, the submission window ignores the queue allowance
    pub backpressure_enabled: bool,
    /// Upper bound on waiting for one chunk in the parallel path
    pub chunk_timeout: Option<Duration>,
    /// Size chunks on the fly from latency feedback (sequential only)
    pub adaptive: bool,
    /// Controller parameters for the adaptive path
    pub sizer: SizerConfig,
    /// Bytes of preceding source handed to the translator as context
    pub context_window_size: usize,
    /// Interval between progress reports
    pub progress_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            streaming_threshold: 64 * 1024,
            chunker: ChunkerConfig::default(),
            parallel: false,
            worker_threads: None,
            max_concurrent_chunks: 4,
            max_queue_size: 2,
            backpressure_enabled: true,
            chunk_timeout: Some(Duration::from_secs(60)),
            adaptive: false,
            sizer: SizerConfig::default(),
            context_window_size: 1024,
            progress_interval: Duration::from_millis(500),
        }
    }
}

impl PipelineConfig {
    /// Preset: fixed chunking, one chunk at a time
    pub fn sequential() -> Self {
        Self::default()
    }

    /// Preset: fixed chunking on a bounded worker pool
    pub fn parallel() -> Self {
        Self {
            parallel: true,
            ..Self::default()
        }
    }

    /// Preset: sequential processing with feedback-driven chunk sizing
    pub fn adaptive() -> Self {
        Self {
            adaptive: true,
            ..Self::default()
        }
    }

    /// Set the streaming threshold in bytes
    pub fn with_streaming_threshold(mut self, bytes: usize) -> Self {
        self.streaming_threshold = bytes;
        self
    }

    /// Set chunking parameters
    pub fn with_chunker(mut self, chunker: ChunkerConfig) -> Self {
        self.chunker = chunker;
        self
    }

    /// Set the concurrency cap and queue allowance
    pub fn with_concurrency(mut self, max_concurrent: usize, max_queue: usize) -> Self {
        self.max_concurrent_chunks = max_concurrent;
        self.max_queue_size = max_queue;
        self
    }

    /// Set or disable the per-chunk timeout
    pub fn with_chunk_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    /// Set controller parameters for the adaptive path
    pub fn with_sizer(mut self, sizer: SizerConfig) -> Self {
        self.sizer = sizer;
        self
    }

    /// Set the translation context window in bytes
    pub fn with_context_window(mut self, bytes: usize) -> Self {
        self.context_window_size = bytes;
        self
    }

    /// In-flight submission cap for the parallel path
    pub fn submission_window(&self) -> usize {
        if self.backpressure_enabled {
            self.max_concurrent_chunks + self.max_queue_size
        } else {
            self.max_concurrent_chunks
        }
    }

    /// Validate all parameters, including cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.adaptive && self.parallel {
            return Err(EngineError::InvalidConfig {
                reason: "adaptive sizing is sequential-only and cannot be combined with parallel processing".to_string(),
            });
        }
        if self.streaming_threshold == 0 {
            return Err(EngineError::InvalidConfig {
                reason: "streaming_threshold must be greater than 0".to_string(),
            });
        }
        if self.parallel && self.max_concurrent_chunks == 0 {
            return Err(EngineError::InvalidConfig {
                reason: "max_concurrent_chunks must be greater than 0".to_string(),
            });
        }
        if self.worker_threads == Some(0) {
            return Err(EngineError::InvalidConfig {
                reason: "worker_threads must be greater than 0".to_string(),
            });
        }
        if self.chunk_timeout == Some(Duration::ZERO) {
            return Err(EngineError::InvalidConfig {
                reason: "chunk_timeout must be greater than 0".to_string(),
            });
        }
        if self.progress_interval.is_zero() {
            return Err(EngineError::InvalidConfig {
                reason: "progress_interval must be greater than 0".to_string(),
            });
        }
        self.chunker.validate()?;
        if self.adaptive {
            self.sizer.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(PipelineConfig::sequential().validate().is_ok());
        assert!(PipelineConfig::parallel().validate().is_ok());
        assert!(PipelineConfig::adaptive().validate().is_ok());
    }

    #[test]
    fn test_adaptive_parallel_conflict_is_rejected() {
        let config = PipelineConfig {
            adaptive: true,
            parallel: true,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_submission_window() {
        let config = PipelineConfig::parallel().with_concurrency(2, 1);
        assert_eq!(config.submission_window(), 3);

        let config = PipelineConfig {
            backpressure_enabled: false,
            ..config
        };
        assert_eq!(config.submission_window(), 2);
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let config = PipelineConfig::parallel().with_chunk_timeout(Some(Duration::ZERO));
        assert!(config.validate().is_err());
    }
}
