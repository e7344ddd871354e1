//! Chunk delivery with retry and exponential backoff.
//!
//! Wraps [`StreamAdapter::deliver`] with a per-attempt timeout and retries
//! transient failures (timeouts, unavailability). A rejection is final and
//! is never retried. Metrics are tracked per adapter.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::adapter::{MessageChunk, StreamAdapter};
use crate::error::DeliveryError;

/// Retry behavior for one adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay for exponential backoff (milliseconds).
    pub base_delay_ms: u64,
    /// Maximum delay cap (milliseconds).
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0) added on top of the computed delay.
    pub jitter_factor: f64,
    pub enabled: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
            jitter_factor: 0.25,
            enabled: true,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no retries.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Result of delivering one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered {
        /// 1 means the first attempt succeeded.
        attempts: u32,
    },
    Failed {
        attempts: u32,
        last_error: DeliveryError,
    },
    /// Retry disabled or the error was not retryable.
    NotRetried { error: DeliveryError },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    pub fn into_result(self) -> Result<u32, DeliveryError> {
        match self {
            DeliveryOutcome::Delivered { attempts } => Ok(attempts),
            DeliveryOutcome::Failed { last_error, .. } => Err(last_error),
            DeliveryOutcome::NotRetried { error } => Err(error),
        }
    }
}

/// Per-adapter counters.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    pub total_attempts: AtomicU64,
    pub successful: AtomicU64,
    pub failed: AtomicU64,
    /// Chunks that needed at least one retry.
    pub retried: AtomicU64,
    pub total_retry_delay_ms: AtomicU64,
}

impl DeliveryMetrics {
    pub fn snapshot(&self) -> DeliverySnapshot {
        let total_attempts = self.total_attempts.load(Ordering::Relaxed);
        let successful = self.successful.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let retried = self.retried.load(Ordering::Relaxed);
        let total_retry_delay_ms = self.total_retry_delay_ms.load(Ordering::Relaxed);

        let total = successful + failed;
        let success_rate = if total > 0 {
            successful as f64 / total as f64
        } else {
            0.0
        };
        let avg_retry_delay_ms = if retried > 0 {
            total_retry_delay_ms as f64 / retried as f64
        } else {
            0.0
        };

        DeliverySnapshot {
            total_attempts,
            successful,
            failed,
            retried,
            avg_retry_delay_ms,
            success_rate,
        }
    }
}

/// Serializable view of [`DeliveryMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct DeliverySnapshot {
    pub total_attempts: u64,
    pub successful: u64,
    pub failed: u64,
    pub retried: u64,
    pub avg_retry_delay_ms: f64,
    /// Fraction in 0.0..=1.0.
    pub success_rate: f64,
}

/// Retry policy and metrics, keyed by adapter name.
pub struct DeliveryRetryManager {
    configs: Arc<RwLock<HashMap<String, RetryConfig>>>,
    metrics: Arc<RwLock<HashMap<String, Arc<DeliveryMetrics>>>>,
    default_config: RetryConfig,
}

impl DeliveryRetryManager {
    pub fn new() -> Self {
        Self::with_default_config(RetryConfig::default())
    }

    pub fn with_default_config(config: RetryConfig) -> Self {
        Self {
            configs: Arc::new(RwLock::new(HashMap::new())),
            metrics: Arc::new(RwLock::new(HashMap::new())),
            default_config: config,
        }
    }

    pub async fn set_adapter_config(&self, adapter: &str, config: RetryConfig) {
        self.configs
            .write()
            .await
            .insert(adapter.to_string(), config);
    }

    /// Config for an adapter, falling back to the default.
    pub async fn get_config(&self, adapter: &str) -> RetryConfig {
        self.configs
            .read()
            .await
            .get(adapter)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone())
    }

    /// Backoff before retry `attempt` (0-based).
    ///
    /// `base_delay * 2^attempt`, capped at `max_delay`, plus up to
    /// `jitter_factor * delay` of random jitter.
    pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
        let exp_delay_ms = config
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        let capped_delay_ms = exp_delay_ms.min(config.max_delay_ms);

        let jitter_range = (capped_delay_ms as f64 * config.jitter_factor.clamp(0.0, 1.0)) as u64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..=jitter_range)
        } else {
            0
        };

        Duration::from_millis(capped_delay_ms.saturating_add(jitter))
    }

    async fn ensure_metrics(&self, adapter: &str) -> Arc<DeliveryMetrics> {
        {
            let metrics = self.metrics.read().await;
            if let Some(m) = metrics.get(adapter) {
                return Arc::clone(m);
            }
        }

        let mut metrics = self.metrics.write().await;
        Arc::clone(metrics.entry(adapter.to_string()).or_default())
    }

    /// Deliver one chunk, bounding every attempt by `attempt_timeout`.
    pub async fn deliver_chunk(
        &self,
        adapter: &dyn StreamAdapter,
        chunk: &MessageChunk,
        session_key: &str,
        attempt_timeout: Duration,
    ) -> DeliveryOutcome {
        let name = adapter.name().to_string();
        let name_ref = &name;
        self.deliver_with_retry(&name, || async move {
            match tokio::time::timeout(attempt_timeout, adapter.deliver(chunk, session_key)).await
            {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Timeout {
                    adapter: name_ref.clone(),
                    timeout: attempt_timeout,
                }),
            }
        })
        .await
    }

    /// Run `operation` until it succeeds, fails permanently, or retries run out.
    pub async fn deliver_with_retry<F, Fut>(&self, adapter: &str, operation: F) -> DeliveryOutcome
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<(), DeliveryError>>,
    {
        let config = self.get_config(adapter).await;
        let metrics = self.ensure_metrics(adapter).await;

        metrics.total_attempts.fetch_add(1, Ordering::Relaxed);
        let first_error = match operation().await {
            Ok(()) => {
                metrics.successful.fetch_add(1, Ordering::Relaxed);
                return DeliveryOutcome::Delivered { attempts: 1 };
            }
            Err(e) => e,
        };

        if !config.enabled || !first_error.is_retryable() {
            metrics.failed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(adapter, error = %first_error, "Delivery failed, not retrying");
            return DeliveryOutcome::NotRetried { error: first_error };
        }
        if config.max_retries == 0 {
            metrics.failed.fetch_add(1, Ordering::Relaxed);
            return DeliveryOutcome::Failed {
                attempts: 1,
                last_error: first_error,
            };
        }

        tracing::debug!(adapter, error = %first_error, "Delivery attempt 1 failed, will retry");

        let mut last_error = first_error;
        let mut total_delay_ms: u64 = 0;
        let mut attempts = 1;

        for attempt in 0..config.max_retries {
            let delay = Self::calculate_delay(&config, attempt);
            total_delay_ms = total_delay_ms.saturating_add(delay.as_millis() as u64);
            tokio::time::sleep(delay).await;

            attempts += 1;
            metrics.total_attempts.fetch_add(1, Ordering::Relaxed);
            match operation().await {
                Ok(()) => {
                    metrics.successful.fetch_add(1, Ordering::Relaxed);
                    metrics.retried.fetch_add(1, Ordering::Relaxed);
                    metrics
                        .total_retry_delay_ms
                        .fetch_add(total_delay_ms, Ordering::Relaxed);
                    tracing::debug!(adapter, attempts, "Delivery succeeded after retry");
                    return DeliveryOutcome::Delivered { attempts };
                }
                Err(e) => {
                    tracing::debug!(adapter, attempt = attempts, error = %e, "Delivery retry failed");
                    let permanent = !e.is_retryable();
                    last_error = e;
                    if permanent {
                        break;
                    }
                }
            }
        }

        metrics.failed.fetch_add(1, Ordering::Relaxed);
        metrics.retried.fetch_add(1, Ordering::Relaxed);
        metrics
            .total_retry_delay_ms
            .fetch_add(total_delay_ms, Ordering::Relaxed);

        tracing::warn!(
            adapter,
            attempts,
            last_error = %last_error,
            "Delivery failed after retries"
        );

        DeliveryOutcome::Failed {
            attempts,
            last_error,
        }
    }

    pub async fn get_metrics(&self, adapter: &str) -> Option<DeliverySnapshot> {
        self.metrics.read().await.get(adapter).map(|m| m.snapshot())
    }

    pub async fn get_all_metrics(&self) -> HashMap<String, DeliverySnapshot> {
        self.metrics
            .read()
            .await
            .iter()
            .map(|(name, m)| (name.clone(), m.snapshot()))
            .collect()
    }

    pub async fn reset_metrics(&self, adapter: &str) {
        let mut metrics = self.metrics.write().await;
        metrics.insert(adapter.to_string(), Arc::new(DeliveryMetrics::default()));
    }
}

impl Default for DeliveryRetryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use super::*;
    use crate::channels::adapter::AdapterCapabilities;
    use crate::channels::adapter::testing::RecordingAdapter;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 10,
            jitter_factor: 0.0,
            enabled: true,
        }
    }

    fn unavailable() -> DeliveryError {
        DeliveryError::Unavailable {
            adapter: "test".to_string(),
            reason: "503".to_string(),
        }
    }

    #[tokio::test]
    async fn test_successful_first_attempt() {
        let manager = DeliveryRetryManager::new();
        let outcome = manager
            .deliver_with_retry("test", || async { Ok(()) })
            .await;
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let manager = DeliveryRetryManager::with_default_config(fast());
        let calls = Arc::new(AtomicU32::new(0));
        let cc = Arc::clone(&calls);
        let outcome = manager
            .deliver_with_retry("test", || {
                let cc = Arc::clone(&cc);
                async move {
                    if cc.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(unavailable())
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_retries_exhausted() {
        let manager = DeliveryRetryManager::with_default_config(RetryConfig {
            max_retries: 2,
            ..fast()
        });
        let outcome = manager
            .deliver_with_retry("test", || async { Err(unavailable()) })
            .await;

        match outcome {
            DeliveryOutcome::Failed {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, unavailable());
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let manager = DeliveryRetryManager::with_default_config(fast());
        let calls = Arc::new(AtomicU32::new(0));
        let cc = Arc::clone(&calls);
        let outcome = manager
            .deliver_with_retry("test", || {
                let cc = Arc::clone(&cc);
                async move {
                    cc.fetch_add(1, Ordering::SeqCst);
                    Err(DeliveryError::Rejected {
                        adapter: "test".to_string(),
                        reason: "too long".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(outcome, DeliveryOutcome::NotRetried { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_disabled() {
        let manager = DeliveryRetryManager::with_default_config(RetryConfig::disabled());
        let outcome = manager
            .deliver_with_retry("test", || async { Err(unavailable()) })
            .await;
        assert_eq!(
            outcome.into_result(),
            Err(unavailable()),
            "disabled retry surfaces the first error"
        );
    }

    #[tokio::test]
    async fn test_zero_retries_fails_after_one_attempt() {
        let manager = DeliveryRetryManager::with_default_config(RetryConfig {
            max_retries: 0,
            ..fast()
        });
        let outcome = manager
            .deliver_with_retry("test", || async { Err(unavailable()) })
            .await;
        assert!(matches!(outcome, DeliveryOutcome::Failed { attempts: 1, .. }));
    }

    #[test]
    fn test_exponential_backoff_calculation() {
        let config = RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(
            DeliveryRetryManager::calculate_delay(&config, 0),
            Duration::from_millis(100)
        );
        assert_eq!(
            DeliveryRetryManager::calculate_delay(&config, 3),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn test_delay_cap_and_jitter_bounds() {
        let config = RetryConfig {
            base_delay_ms: 1000,
            max_delay_ms: 2000,
            jitter_factor: 0.5,
            ..RetryConfig::default()
        };
        for _ in 0..50 {
            let delay = DeliveryRetryManager::calculate_delay(&config, 10);
            assert!(delay >= Duration::from_millis(2000));
            assert!(delay <= Duration::from_millis(3000));
        }
    }

    #[test]
    fn test_overflow_safety_high_attempts() {
        let config = RetryConfig {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(
            DeliveryRetryManager::calculate_delay(&config, 200),
            Duration::from_millis(60_000)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_track_outcomes() {
        let manager = DeliveryRetryManager::with_default_config(RetryConfig {
            max_retries: 1,
            ..fast()
        });
        manager.deliver_with_retry("a", || async { Ok(()) }).await;
        manager
            .deliver_with_retry("a", || async { Err(unavailable()) })
            .await;

        let snap = manager.get_metrics("a").await.unwrap();
        assert_eq!(snap.successful, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.retried, 1);
        assert_eq!(snap.total_attempts, 3);
        assert!((snap.success_rate - 0.5).abs() < f64::EPSILON);

        assert!(manager.get_metrics("b").await.is_none());
        manager.reset_metrics("a").await;
        assert_eq!(manager.get_metrics("a").await.unwrap().total_attempts, 0);
    }

    #[tokio::test]
    async fn test_per_adapter_config() {
        let manager = DeliveryRetryManager::new();
        manager
            .set_adapter_config("sms", RetryConfig::disabled())
            .await;
        assert!(!manager.get_config("sms").await.enabled);
        assert_eq!(manager.get_config("slack").await, RetryConfig::default());
    }

    struct StallingAdapter;

    #[async_trait]
    impl StreamAdapter for StallingAdapter {
        fn name(&self) -> &str {
            "stall"
        }

        fn capabilities(&self) -> AdapterCapabilities {
            AdapterCapabilities::streaming(100)
        }

        async fn deliver(&self, _chunk: &MessageChunk, _session_key: &str) -> Result<(), DeliveryError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_chunk_times_out_each_attempt() {
        let manager = DeliveryRetryManager::with_default_config(RetryConfig {
            max_retries: 1,
            ..fast()
        });
        let chunk = MessageChunk::new("hi", 0, true);
        let outcome = manager
            .deliver_chunk(&StallingAdapter, &chunk, "s1", Duration::from_millis(50))
            .await;

        match outcome {
            DeliveryOutcome::Failed {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 2);
                assert!(matches!(last_error, DeliveryError::Timeout { .. }));
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deliver_chunk_through_adapter() {
        let manager = DeliveryRetryManager::new();
        let adapter = RecordingAdapter::new("rec", AdapterCapabilities::streaming(100));
        let chunk = MessageChunk::new("hello", 0, true);
        let outcome = manager
            .deliver_chunk(&adapter, &chunk, "s1", Duration::from_secs(1))
            .await;
        assert!(outcome.is_delivered());
        assert_eq!(adapter.texts(), vec!["hello"]);
    }
}
