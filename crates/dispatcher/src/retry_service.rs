use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use taskpool_core::{
    config::RetryConfig,
    models::{ErrorType, Task},
};

/// 一次失败后的处理结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// 重新排队，退避结束前不会再次分配
    Requeue { not_before: DateTime<Utc> },
    /// 任务失败，不再重试
    Fail,
}

/// 重试退避策略
///
/// 第 `attempt` 次执行失败后的等待时间为
/// `base_delay · multiplier^(attempt-1)`，不超过 `max_delay`，
/// 再叠加 `±jitter_factor` 比例的随机抖动。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// 不含抖动的退避时间
    pub fn backoff_delay(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).max(0);
        let delay_ms = self.config.base_delay_ms as f64
            * self.config.backoff_multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped_ms.max(0.0) as u64)
    }

    /// 叠加随机抖动后的退避时间
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: i32, rng: &mut R) -> Duration {
        let delay = self.backoff_delay(attempt);
        let jitter_factor = self.config.jitter_factor;
        if jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }

        let jitter = rng.random_range(-jitter_factor..=jitter_factor);
        delay.mul_f64((1.0 + jitter).max(0.0))
    }

    pub fn next_retry_time(&self, attempt: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.jittered_delay(attempt, &mut rand::rng());
        now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero())
    }

    /// 决定一次失败后任务的去向
    ///
    /// 致命错误或不可重试的失败直接结束；否则只要 `attempt_count ≤ max_retries` 就重新排队。
    pub fn decide(
        &self,
        task: &Task,
        error_type: ErrorType,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if error_type.is_fatal() || !retryable || !task.can_retry() {
            return RetryDecision::Fail;
        }
        RetryDecision::Requeue {
            not_before: self.next_retry_time(task.attempt_count, now),
        }
    }

    /// 同步调用方最多需要等待的时间：每次执行的超时加上各次退避的上限
    pub fn total_budget(&self, max_retries: i32, attempt_timeout: Duration) -> Duration {
        let attempts = max_retries.max(0) as u32 + 1;
        let backoff: Duration = (1..attempts as i32)
            .map(|attempt| {
                self.backoff_delay(attempt)
                    .mul_f64(1.0 + self.config.jitter_factor.max(0.0))
            })
            .sum();
        attempt_timeout * attempts + backoff
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use serde_json::json;
    use taskpool_core::models::TaskSubmission;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        })
    }

    fn task_with_attempts(attempt_count: i32, max_retries: i32) -> Task {
        let mut task = Task::new(
            TaskSubmission::new("chat", json!({"prompt": "hi"})).with_max_retries(max_retries),
            1,
        );
        task.attempt_count = attempt_count;
        task
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let policy = policy();
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(4), Duration::from_secs(5));
        assert_eq!(policy.backoff_delay(20), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(RetryConfig {
            jitter_factor: 0.2,
            ..policy().config().clone()
        });
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let delay = policy.jittered_delay(2, &mut rng);
            assert!(delay >= Duration::from_millis(1600));
            assert!(delay <= Duration::from_millis(2400));
        }
    }

    #[test]
    fn test_decide_requeues_then_fails() {
        let policy = policy();
        let now = Utc::now();

        match policy.decide(&task_with_attempts(1, 1), ErrorType::Timeout, true, now) {
            RetryDecision::Requeue { not_before } => {
                assert_eq!(not_before, now + chrono::Duration::seconds(1));
            }
            RetryDecision::Fail => panic!("第一次失败应当重试"),
        }

        assert_eq!(
            policy.decide(&task_with_attempts(2, 1), ErrorType::Timeout, true, now),
            RetryDecision::Fail
        );
    }

    #[test]
    fn test_fatal_errors_never_retry() {
        let policy = policy();
        let now = Utc::now();
        let task = task_with_attempts(1, 3);

        assert_eq!(
            policy.decide(&task, ErrorType::InvalidInput, true, now),
            RetryDecision::Fail
        );
        assert_eq!(
            policy.decide(&task, ErrorType::WorkerError, false, now),
            RetryDecision::Fail
        );
    }

    #[test]
    fn test_total_budget_includes_backoff() {
        let policy = policy();
        let budget = policy.total_budget(2, Duration::from_secs(10));
        // 3次执行 + 1s + 2s 退避
        assert_eq!(budget, Duration::from_secs(33));
    }
}
