use std::time::Duration;

use rand::Rng;

use crate::core::error::TaskError;

/// 重试退避策略
///
/// 第 n 次重试前的等待时间在 `[0, delays[min(n, len-1)]]` 内均匀随机，
/// 随机抖动避免大量任务在同一时刻一起重试。
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(60),
                Duration::from_secs(60 * 60),
                Duration::from_secs(6 * 60 * 60),
            ],
        }
    }
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// 该错误是否值得重试
    pub fn should_retry(&self, error: &TaskError) -> bool {
        error.is_retryable()
    }

    /// 第 `retry_count` 次重试的等待上限
    pub fn max_delay(&self, retry_count: u32) -> Duration {
        match self.delays.len() {
            0 => Duration::ZERO,
            len => self.delays[(retry_count as usize).min(len - 1)],
        }
    }

    pub fn delay(&self, retry_count: u32) -> Duration {
        let cap = self.max_delay(retry_count);
        if cap.is_zero() {
            return cap;
        }
        let millis = rand::thread_rng().gen_range(0..=cap.as_millis() as u64);
        Duration::from_millis(millis)
    }
}
