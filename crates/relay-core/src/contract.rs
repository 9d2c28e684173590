use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{RelayError, codes};

/// 取消原语，统一表达跨模块的可中断性契约。
///
/// # 设计背景（Why）
/// - 所有长时间运行的操作（排队等待、重试睡眠、幂等轮询）都必须能被外部
///   主动打断，以避免雪崩扩散或无意义的资源占用。
/// - 纯轮询式的取消位在挂起等待场景下感知滞后，因此在原子位之外附加一个
///   通知原语，让挂起中的等待者可以被立即唤醒。
///
/// # 逻辑解析（How）
/// - 内部使用 [`AtomicBool`] 表达取消状态，并通过 [`Arc`] 支持多方共享。
/// - `cancel` 在首次成功设置取消位时返回 `true` 并唤醒全部等待者；
///   后续重复调用返回 `false`，提示调用方避免重复执行业务兜底。
/// - `cancelled` 返回一个在取消发生时完成的 Future，供 `select!` 场景组合。
/// - `child` 生成共享同一取消位的派生实例，便于在不同子系统传播取消信号。
///
/// # 契约说明（What）
/// - **前置条件**：构造时无需额外参数，默认处于“未取消”状态。
/// - **后置条件**：一旦 `cancel` 成功，`is_cancelled` 必须全局可见，且所有
///   正在 `cancelled().await` 的任务都会被唤醒。
///
/// # 设计取舍与风险（Trade-offs）
/// - 框架不会强制终止正在执行的 Future；取消始终是协作式的，关键热路径仍需
///   自行检查 `is_cancelled` 或组合 `cancelled()`。
#[derive(Clone, Debug)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Debug)]
struct CancellationState {
    flag: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    /// 创建处于“未取消”状态的取消令牌。
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancellationState {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// 查询当前是否已被标记取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 将当前令牌标记为取消。
    ///
    /// 返回值为 `true` 表示本次调用首次触发取消；返回 `false` 表示之前已被取消。
    pub fn cancel(&self) -> bool {
        let first = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// 等待取消发生；若已经取消则立即完成。
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            // notified() 先注册再检查，避免“检查-挂起”窗口内丢失唤醒。
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// 派生共享同一取消位的子令牌，用于跨模块传播取消语义。
    pub fn child(&self) -> Self {
        self.clone()
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// 截止原语，统一描述操作的最迟完成时间。
///
/// # 设计背景（Why）
/// - `Deadline` 以单调时钟的绝对时间点表达硬超时，避免壁钟回拨造成误判；
///   搭配 [`Cancellation`] 可以实现统一的“超时即取消”策略。
///
/// # 契约说明（What）
/// - `Deadline` 可以为空（未设置），此时代表调用方未施加硬超时限制。
/// - `after` 以当前时间点加持续时间生成新的截止点。
/// - `is_expired` 与 `remaining` 均以调用时刻的单调时钟为准。
///
/// # 风险提示（Trade-offs）
/// - 截止时间不会自动驱动取消；检测到超时后是否调用 [`Cancellation::cancel`]
///   由上层策略决定。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline {
    instant: Option<Instant>,
}

impl Deadline {
    /// 创建未设置截止时间的实例。
    pub const fn none() -> Self {
        Self { instant: None }
    }

    /// 根据绝对时间点构造截止时间。
    pub fn at(instant: Instant) -> Self {
        Self {
            instant: Some(instant),
        }
    }

    /// 基于当前时刻加持续时间生成截止时间。
    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    /// 返回内部时间点，便于与自定义调度器协作。
    pub fn instant(&self) -> Option<Instant> {
        self.instant
    }

    /// 判断是否已经超时。
    pub fn is_expired(&self) -> bool {
        match self.instant {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// 计算距离截止点的剩余时长；未设置截止时间时返回 `None`。
    ///
    /// 已超时的截止点返回 `Some(Duration::ZERO)`，调用方可据此立即失败。
    pub fn remaining(&self) -> Option<Duration> {
        self.instant
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Deadline::none()
    }
}

/// 级联超时预算，表达“总额度 + 已消耗”的可传递时间限额。
///
/// # 设计背景（Why）
/// - 多级中间件各自施加超时时，若彼此独立计时，内层的等待可能超出调用方的
///   总预期。预算结构将总额度显式化：每一级 `consume` 自己用掉的部分，再把
///   收窄后的预算传给内层。
///
/// # 契约说明（What）
/// - `consume` 在额度不足时返回 [`codes::DEADLINE_EXCEEDED`] 错误，成功时
///   扣减额度；`remaining` 返回剩余额度。
/// - 预算是值语义结构，跨层传递时按值拷贝，互不影响。
///
/// # 风险提示（Trade-offs）
/// - 预算只做记账，不会自动打断执行；与 [`Deadline`] 配合可实现硬超时。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutBudget {
    total: Duration,
    consumed: Duration,
}

impl TimeoutBudget {
    /// 以总额度创建预算，初始消耗为零。
    pub const fn new(total: Duration) -> Self {
        Self {
            total,
            consumed: Duration::ZERO,
        }
    }

    /// 总额度。
    pub fn total(&self) -> Duration {
        self.total
    }

    /// 已消耗额度。
    pub fn consumed(&self) -> Duration {
        self.consumed
    }

    /// 剩余额度。
    pub fn remaining(&self) -> Duration {
        self.total.saturating_sub(self.consumed)
    }

    /// 是否已经耗尽。
    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    /// 记账消耗指定时长；额度不足时返回错误且不产生部分扣减。
    pub fn consume(&mut self, elapsed: Duration) -> Result<(), RelayError> {
        if elapsed > self.remaining() {
            return Err(RelayError::new(
                codes::DEADLINE_EXCEEDED,
                "级联超时预算不足，放弃继续执行",
            ));
        }
        self.consumed += elapsed;
        Ok(())
    }

    /// 生成收窄后的内层预算：总额度等于当前剩余额度。
    pub fn narrowed(&self) -> TimeoutBudget {
        TimeoutBudget::new(self.remaining())
    }
}
