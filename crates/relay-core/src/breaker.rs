use std::borrow::Cow;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// 熔断器配置；四个参数均必须严格为正。
#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// 连续失败多少次后打开。
    pub failure_threshold: u32,
    /// 半开状态需要多少次探测成功才恢复关闭。
    pub success_threshold: u32,
    /// 打开状态维持的时长，到期进入半开。
    pub open_timeout: Duration,
    /// 关闭状态下距最近一次失败超过该时长即清零连续失败计数。
    pub closed_reset_timeout: Duration,
}

impl BreakerConfig {
    /// 校验配置合法性。
    pub fn validate(&self) -> Result<(), BreakerConfigError> {
        if self.failure_threshold == 0 {
            return Err(BreakerConfigError::ZeroFailureThreshold);
        }
        if self.success_threshold == 0 {
            return Err(BreakerConfigError::ZeroSuccessThreshold);
        }
        if self.open_timeout.is_zero() {
            return Err(BreakerConfigError::ZeroOpenTimeout);
        }
        if self.closed_reset_timeout.is_zero() {
            return Err(BreakerConfigError::ZeroClosedResetTimeout);
        }
        Ok(())
    }
}

/// 熔断器配置校验错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum BreakerConfigError {
    #[error("failure_threshold 必须大于 0")]
    ZeroFailureThreshold,
    #[error("success_threshold 必须大于 0")]
    ZeroSuccessThreshold,
    #[error("open_timeout 必须严格为正")]
    ZeroOpenTimeout,
    #[error("closed_reset_timeout 必须严格为正")]
    ZeroClosedResetTimeout,
}

#[derive(Clone, Copy, Debug)]
enum BreakerState {
    Closed {
        consecutive_failures: u32,
        last_failure_at: Option<Instant>,
    },
    Open {
        until: Instant,
    },
    HalfOpen {
        successes: u32,
        probe_in_flight: bool,
    },
}

/// 对外可见的熔断器状态快照。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum BreakerStateSnapshot {
    /// 关闭：请求正常放行。
    Closed,
    /// 打开：在 `until` 之前拒绝所有请求。
    Open {
        /// 打开状态的到期时间点。
        until: Instant,
    },
    /// 半开：以单探测方式试探下游恢复情况。
    HalfOpen,
}

/// `allow`/`record_*` 触发的状态迁移，供观测层转译为事件。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum BreakerTransition {
    /// 进入打开状态。
    Opened,
    /// 进入半开状态。
    HalfOpened,
    /// 恢复关闭状态。
    Closed,
}

/// 三态失败隔离器：Closed ↔ Open ↔ HalfOpen。
///
/// # 设计背景（Why）
/// - 下游持续失败时继续放行只会加剧故障扩散；熔断器以连续失败计数打开
///   隔离，再以受控的单探测试探恢复，避免恢复初期被流量击穿。
///
/// # 逻辑解析（How）
/// - 全部状态由单把互斥锁守护，`allow` 与 `record_success`/`record_failure`
///   之间的竞争在锁上序列化；外部读取到的状态可能滞后，但永远是某个真实
///   到达过的状态。
/// - `Closed`：失败计数达到阈值即转入 `Open{until}`；距最近一次失败超过
///   `closed_reset_timeout` 时计数自动清零。
/// - `Open`：到期前 `allow` 一律拒绝；到期后的第一次 `allow` 转入 `HalfOpen`
///   并放行唯一探测。
/// - `HalfOpen`：同一时刻至多一个探测在途；探测成功累计到 `success_threshold`
///   即恢复 `Closed`，探测失败立刻回到 `Open{until=now+open_timeout}`。
///
/// # 契约说明（What）
/// - `record_*` 返回本次调用触发的状态迁移（若有），供上层发布事件；
/// - 打开期间收到的迟到回执（stale record）被忽略，不影响状态机。
pub struct CircuitBreaker {
    name: Cow<'static, str>,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// 以名称与合法配置构造熔断器。
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        config: BreakerConfig,
    ) -> Result<Self, BreakerConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
                last_failure_at: None,
            }),
        })
    }

    /// 获取熔断器名称。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 判定本次请求是否放行；半开转入由本方法驱动。
    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed {
                consecutive_failures,
                last_failure_at,
            } => {
                // 静默期足够长时视作下游已恢复，清零连续失败计数。
                if let Some(at) = last_failure_at {
                    if consecutive_failures > 0
                        && now.saturating_duration_since(at) >= self.config.closed_reset_timeout
                    {
                        *state = BreakerState::Closed {
                            consecutive_failures: 0,
                            last_failure_at: None,
                        };
                    }
                }
                true
            }
            BreakerState::Open { until } => {
                if now >= until {
                    *state = BreakerState::HalfOpen {
                        successes: 0,
                        probe_in_flight: true,
                    };
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen {
                successes,
                probe_in_flight,
            } => {
                if probe_in_flight {
                    false
                } else {
                    *state = BreakerState::HalfOpen {
                        successes,
                        probe_in_flight: true,
                    };
                    true
                }
            }
        }
    }

    /// 记录一次成功回执。
    pub fn record_success(&self) -> Option<BreakerTransition> {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed { .. } => {
                *state = BreakerState::Closed {
                    consecutive_failures: 0,
                    last_failure_at: None,
                };
                None
            }
            // 打开期间的迟到成功回执不改变状态。
            BreakerState::Open { .. } => None,
            BreakerState::HalfOpen { successes, .. } => {
                let successes = successes + 1;
                if successes >= self.config.success_threshold {
                    *state = BreakerState::Closed {
                        consecutive_failures: 0,
                        last_failure_at: None,
                    };
                    Some(BreakerTransition::Closed)
                } else {
                    *state = BreakerState::HalfOpen {
                        successes,
                        probe_in_flight: false,
                    };
                    None
                }
            }
        }
    }

    /// 记录一次失败回执。
    pub fn record_failure(&self) -> Option<BreakerTransition> {
        let now = Instant::now();
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed {
                consecutive_failures,
                ..
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.config.failure_threshold {
                    *state = BreakerState::Open {
                        until: now + self.config.open_timeout,
                    };
                    Some(BreakerTransition::Opened)
                } else {
                    *state = BreakerState::Closed {
                        consecutive_failures: failures,
                        last_failure_at: Some(now),
                    };
                    None
                }
            }
            // 打开期间的迟到失败回执不改变状态。
            BreakerState::Open { .. } => None,
            BreakerState::HalfOpen { .. } => {
                *state = BreakerState::Open {
                    until: now + self.config.open_timeout,
                };
                Some(BreakerTransition::Opened)
            }
        }
    }

    /// 读取当前状态快照；读取结果可能滞后于并发迁移，但不会是不可达状态。
    pub fn state(&self) -> BreakerStateSnapshot {
        match *self.state.lock() {
            BreakerState::Closed { .. } => BreakerStateSnapshot::Closed,
            BreakerState::Open { until } => BreakerStateSnapshot::Open { until },
            BreakerState::HalfOpen { .. } => BreakerStateSnapshot::HalfOpen,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
