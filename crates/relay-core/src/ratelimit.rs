use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

/// 某一标识当前的限额视图。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// 限额上限。
    pub limit: u64,
    /// 当前剩余额度。
    pub remaining: u64,
    /// 额度完全恢复的时间点。
    pub reset_at: Instant,
}

/// 速率限制器契约。
///
/// # 契约说明（What）
/// - `allow` 以给定代价尝试扣减标识对应的额度，返回是否放行；
/// - `status` 返回该标识的限额视图，供错误响应携带 `limit/remaining/reset_at`。
pub trait RateLimiter: Send + Sync + 'static {
    /// 尝试以 `cost` 代价放行一次调用。
    fn allow(&self, identifier: &str, cost: u64) -> bool;

    /// 查询标识的限额视图。
    fn status(&self, identifier: &str) -> RateLimitStatus;
}

/// 令牌桶限速配置。
#[derive(Clone, Copy, Debug)]
pub struct TokenBucketConfig {
    /// 桶容量（突发上限）。
    pub capacity: u64,
    /// 每秒补充的令牌数。
    pub refill_per_second: f64,
}

impl TokenBucketConfig {
    /// 校验配置合法性。
    pub fn validate(&self) -> Result<(), TokenBucketConfigError> {
        if self.capacity == 0 {
            return Err(TokenBucketConfigError::ZeroCapacity);
        }
        if !(self.refill_per_second > 0.0) {
            return Err(TokenBucketConfigError::NonPositiveRefill);
        }
        Ok(())
    }
}

/// 令牌桶配置校验错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TokenBucketConfigError {
    #[error("capacity 必须大于 0")]
    ZeroCapacity,
    #[error("refill_per_second 必须严格为正")]
    NonPositiveRefill,
}

struct Bucket {
    tokens: f64,
    updated_at: Instant,
}

/// 按标识分桶的进程内令牌桶限速器。
///
/// # 逻辑解析（How）
/// - 每个标识一只桶；读写在桶级互斥锁内完成，补充按流逝时间懒计算，
///   不依赖后台任务。
pub struct TokenBucketLimiter {
    config: TokenBucketConfig,
    buckets: DashMap<String, Mutex<Bucket>>,
}

impl TokenBucketLimiter {
    /// 以合法配置构造限速器。
    pub fn new(config: TokenBucketConfig) -> Result<Self, TokenBucketConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            buckets: DashMap::new(),
        })
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.updated_at);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.config.refill_per_second)
            .min(self.config.capacity as f64);
        bucket.updated_at = now;
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn allow(&self, identifier: &str, cost: u64) -> bool {
        let entry = self
            .buckets
            .entry(identifier.to_string())
            .or_insert_with(|| {
                Mutex::new(Bucket {
                    tokens: self.config.capacity as f64,
                    updated_at: Instant::now(),
                })
            });
        let mut bucket = entry.lock();
        self.refill(&mut bucket);
        if bucket.tokens >= cost as f64 {
            bucket.tokens -= cost as f64;
            true
        } else {
            false
        }
    }

    fn status(&self, identifier: &str) -> RateLimitStatus {
        let now = Instant::now();
        match self.buckets.get(identifier) {
            Some(entry) => {
                let mut bucket = entry.lock();
                self.refill(&mut bucket);
                let deficit = self.config.capacity as f64 - bucket.tokens;
                let reset_in = if deficit <= 0.0 {
                    Duration::ZERO
                } else {
                    Duration::from_secs_f64(deficit / self.config.refill_per_second)
                };
                RateLimitStatus {
                    limit: self.config.capacity,
                    remaining: bucket.tokens.floor() as u64,
                    reset_at: now + reset_in,
                }
            }
            None => RateLimitStatus {
                limit: self.config.capacity,
                remaining: self.config.capacity,
                reset_at: now,
            },
        }
    }
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("capacity", &self.config.capacity)
            .field("buckets", &self.buckets.len())
            .finish()
    }
}
