use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::contract::{Cancellation, Deadline};
use crate::error::{RelayError, codes};

/// 错误分类器：判定一次失败是否值得重试。
///
/// # 契约说明（What）
/// - 分类器只读错误，不得产生副作用；取消与截止错误在引擎内部固定为不可
///   重试，分类器无需（也无法）覆盖这两类判定。
pub trait ErrorClassifier: Send + Sync + 'static {
    /// 返回 `true` 表示该错误可重试。
    fn should_retry(&self, error: &RelayError) -> bool;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&RelayError) -> bool + Send + Sync + 'static,
{
    fn should_retry(&self, error: &RelayError) -> bool {
        self(error)
    }
}

/// 缺省分类器：除取消与截止外一律可重试。
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryAllTransient;

impl ErrorClassifier for RetryAllTransient {
    fn should_retry(&self, _error: &RelayError) -> bool {
        true
    }
}

/// 重试间隔策略。
///
/// # 契约说明（What）
/// - `delay_for(attempt)` 返回第 `attempt` 次失败之后、下一次尝试之前的
///   等待时长，`attempt` 从 1 计数；
/// - 指数族以 `base * factor^(attempt-1)` 增长并以 `cap` 封顶；
/// - 抖动变体在 `[0, 指数值]` 区间内均匀取样（full jitter），用于打散
///   同步重试风暴。
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub enum DelayStrategy {
    /// 不等待，立即重试。
    None,
    /// 固定间隔。
    Fixed {
        /// 每次重试前的等待时长。
        delay: Duration,
    },
    /// 指数退避。
    Exponential {
        /// 初始间隔。
        base: Duration,
        /// 增长因子，应不小于 1。
        factor: f64,
        /// 间隔上限。
        cap: Duration,
    },
    /// 带全抖动的指数退避。
    JitteredExponential {
        /// 初始间隔。
        base: Duration,
        /// 增长因子，应不小于 1。
        factor: f64,
        /// 间隔上限。
        cap: Duration,
    },
}

impl DelayStrategy {
    /// 计算第 `attempt` 次失败后的等待时长。
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            DelayStrategy::None => Duration::ZERO,
            DelayStrategy::Fixed { delay } => delay,
            DelayStrategy::Exponential { base, factor, cap } => {
                exponential_delay(base, factor, cap, attempt)
            }
            DelayStrategy::JitteredExponential { base, factor, cap } => {
                let upper = exponential_delay(base, factor, cap, attempt);
                if upper.is_zero() {
                    return Duration::ZERO;
                }
                let fraction: f64 = rand::thread_rng().gen_range(0.0..=1.0);
                upper.mul_f64(fraction)
            }
        }
    }
}

fn exponential_delay(base: Duration, factor: f64, cap: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let scaled = base.as_secs_f64() * factor.powi(exponent);
    let capped = scaled.min(cap.as_secs_f64());
    if capped.is_finite() && capped > 0.0 {
        Duration::from_secs_f64(capped)
    } else if capped <= 0.0 {
        Duration::ZERO
    } else {
        cap
    }
}

/// 重试策略：次数上限 + 分类器 + 间隔策略 + 可选总时长预算。
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    strategy: DelayStrategy,
    classifier: Arc<dyn ErrorClassifier>,
    max_total_budget: Option<Duration>,
}

impl RetryPolicy {
    /// 以尝试次数上限构造策略；`max_attempts` 必须至少为 1。
    pub fn new(max_attempts: u32) -> Result<Self, RetryPolicyError> {
        if max_attempts == 0 {
            return Err(RetryPolicyError::ZeroAttempts);
        }
        Ok(Self {
            max_attempts,
            strategy: DelayStrategy::None,
            classifier: Arc::new(RetryAllTransient),
            max_total_budget: None,
        })
    }

    /// 设置间隔策略。
    pub fn with_strategy(mut self, strategy: DelayStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// 设置错误分类器。
    pub fn with_classifier(mut self, classifier: impl ErrorClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// 设置总时长预算：超出后提前放弃，或截短最后一次等待。
    pub fn with_total_budget(mut self, budget: Duration) -> Self {
        self.max_total_budget = Some(budget);
        self
    }

    /// 尝试次数上限。
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("strategy", &self.strategy)
            .field("max_total_budget", &self.max_total_budget)
            .finish()
    }
}

/// 重试策略校验错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum RetryPolicyError {
    #[error("max_attempts 必须至少为 1")]
    ZeroAttempts,
}

/// 有界重试引擎。
///
/// # 逻辑解析（How）
/// - 每轮调用被包裹的操作一次；失败后依次判定：因果性中止（取消/截止）
///   直接上抛、分类器判不可重试直接上抛、次数耗尽包裹为
///   [`codes::RETRY_EXHAUSTED`]。
/// - 两次尝试之间按策略睡眠；设置总预算时，睡眠被截短到剩余预算内，预算
///   已尽则以 [`codes::RETRY_BUDGET_EXHAUSTED`] 提前放弃。
/// - 睡眠期间收到取消信号时，以取消错误上抛并将最近一次失败挂入错误链
///   （取消是因果方）。
///
/// # 风险提示（Trade-offs）
/// - 重复执行操作的副作用由调用方负责；需要至多一次语义时应与幂等协调器
///   组合使用。
#[derive(Clone, Debug)]
pub struct RetryEngine {
    policy: RetryPolicy,
}

impl RetryEngine {
    /// 以策略构造引擎。
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// 访问策略。
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 执行操作，按策略重试；`operation` 收到从 1 起算的尝试序号。
    pub async fn execute<T, F, Fut>(
        &self,
        cancellation: &Cancellation,
        deadline: Deadline,
        mut operation: F,
    ) -> Result<T, RelayError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 1;
        loop {
            if cancellation.is_cancelled() {
                return Err(RelayError::cancelled());
            }
            if deadline.is_expired() {
                return Err(RelayError::deadline_exceeded());
            }

            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if error.is_cancellation() || error.is_deadline() {
                return Err(error);
            }
            if !self.policy.classifier.should_retry(&error) {
                return Err(error);
            }
            if attempt >= self.policy.max_attempts {
                // 单次策略等价于直通，不引入额外包装。
                if self.policy.max_attempts == 1 {
                    return Err(error);
                }
                return Err(RelayError::new(
                    codes::RETRY_EXHAUSTED,
                    format!("重试 {attempt} 次后仍然失败"),
                )
                .with_cause(error));
            }

            let mut delay = self.policy.strategy.delay_for(attempt);
            if let Some(budget) = self.policy.max_total_budget {
                let elapsed = started.elapsed();
                if elapsed >= budget {
                    return Err(RelayError::new(
                        codes::RETRY_BUDGET_EXHAUSTED,
                        "重试总时长预算耗尽，提前放弃",
                    )
                    .with_cause(error));
                }
                delay = delay.min(budget - elapsed);
            }

            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancellation.cancelled() => {
                        return Err(RelayError::cancelled().with_cause(error));
                    }
                }
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 验证：指数退避按因子增长并在上限封顶。
    #[test]
    fn exponential_delay_grows_and_caps() {
        let strategy = DelayStrategy::Exponential {
            base: Duration::from_millis(100),
            factor: 2.0,
            cap: Duration::from_millis(350),
        };
        assert_eq!(strategy.delay_for(1), Duration::from_millis(100));
        assert_eq!(strategy.delay_for(2), Duration::from_millis(200));
        assert_eq!(strategy.delay_for(3), Duration::from_millis(350));
        assert_eq!(strategy.delay_for(10), Duration::from_millis(350));
    }

    /// 验证：全抖动的取样落在 `[0, 指数值]` 区间内。
    #[test]
    fn jittered_delay_stays_within_envelope() {
        let strategy = DelayStrategy::JitteredExponential {
            base: Duration::from_millis(100),
            factor: 2.0,
            cap: Duration::from_secs(1),
        };
        for attempt in 1..=4 {
            let upper = DelayStrategy::Exponential {
                base: Duration::from_millis(100),
                factor: 2.0,
                cap: Duration::from_secs(1),
            }
            .delay_for(attempt);
            for _ in 0..32 {
                let sampled = strategy.delay_for(attempt);
                assert!(sampled <= upper, "抖动取样不得超过指数包络");
            }
        }
    }

    /// 验证：次数上限为零在构造期被拒绝。
    #[test]
    fn zero_attempts_is_rejected() {
        assert!(matches!(
            RetryPolicy::new(0),
            Err(RetryPolicyError::ZeroAttempts)
        ));
    }
}
