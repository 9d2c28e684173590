use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::contract::{Cancellation, Deadline};
use crate::error::{RelayError, codes};

/// 队列溢出时的处置策略。
///
/// # 契约说明（What）
/// - `Suspend`：等待者按 FIFO 入队挂起，有空位时按入队顺序恢复；在途上限
///   触顶时新来者以 `Refused` 失败。
/// - `DropNewest`：在途上限触顶时让新来者以 `DroppedNewest` 立即失败，不入队。
/// - `DropOldest`：在途上限触顶时驱逐最老的等待者（令其以 `DroppedOldest`
///   失败），再将新来者入队。
/// - `Refuse`：从不排队；无空闲并发槽位时新来者以 `Refused` 立即失败。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum OverflowStrategy {
    /// 挂起等待，FIFO 恢复。
    Suspend,
    /// 丢弃新来者。
    DropNewest,
    /// 驱逐最老等待者。
    DropOldest,
    /// 拒绝排队，立即失败。
    Refuse,
}

/// 背压溢出的机器可读原因，附着在错误链上。
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum OverflowReason {
    /// 新来者被丢弃。
    #[error("dropped_newest")]
    DroppedNewest,
    /// 最老等待者被驱逐。
    #[error("dropped_oldest")]
    DroppedOldest,
    /// 入口直接拒绝。
    #[error("refused")]
    Refused,
}

/// 从错误链中提取背压溢出原因；非溢出错误返回 `None`。
pub fn overflow_reason(error: &RelayError) -> Option<OverflowReason> {
    if !error.is_overflow() {
        return None;
    }
    error.cause().and_then(|cause| {
        let as_error: &(dyn std::error::Error + 'static) = cause.as_ref();
        as_error.downcast_ref::<OverflowReason>().copied()
    })
}

/// 背压信号量配置。
///
/// # 契约说明（What）
/// - `max_concurrency`：同时持有令牌的上限，必须大于 0；
/// - `max_outstanding`：在途上限（活跃 + 排队），`None` 表示不设限；
/// - `max_queue_bytes`：等待队列的代价（字节）账面上限，属于**咨询性**约束：
///   入队时以累计代价对照上限判断，`DropOldest` 驱逐一名等待者后放行新来者，
///   允许瞬时轻微越界；
/// - `strategy`：溢出处置策略。
#[derive(Clone, Debug)]
pub struct BackPressureConfig {
    pub max_concurrency: usize,
    pub max_outstanding: Option<usize>,
    pub max_queue_bytes: Option<u64>,
    pub strategy: OverflowStrategy,
}

impl BackPressureConfig {
    /// 以并发上限与策略构造配置，队列上限默认不设。
    pub fn new(max_concurrency: usize, strategy: OverflowStrategy) -> Self {
        Self {
            max_concurrency,
            max_outstanding: None,
            max_queue_bytes: None,
            strategy,
        }
    }

    /// 设置等待队列长度上限。
    pub fn with_max_outstanding(mut self, max_outstanding: usize) -> Self {
        self.max_outstanding = Some(max_outstanding);
        self
    }

    /// 设置等待队列代价账面上限。
    pub fn with_max_queue_bytes(mut self, max_queue_bytes: u64) -> Self {
        self.max_queue_bytes = Some(max_queue_bytes);
        self
    }

    /// 校验配置合法性。
    pub fn validate(&self) -> Result<(), BackPressureConfigError> {
        if self.max_concurrency == 0 {
            return Err(BackPressureConfigError::ZeroConcurrency);
        }
        if self.max_outstanding == Some(0) {
            return Err(BackPressureConfigError::ZeroOutstanding);
        }
        if self.max_queue_bytes == Some(0) {
            return Err(BackPressureConfigError::ZeroQueueBytes);
        }
        Ok(())
    }
}

/// 背压配置校验错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum BackPressureConfigError {
    /// 并发上限为零。
    #[error("max_concurrency 必须大于 0")]
    ZeroConcurrency,
    /// 队列长度上限为零。
    #[error("max_outstanding 若设置必须大于 0")]
    ZeroOutstanding,
    /// 队列代价上限为零。
    #[error("max_queue_bytes 若设置必须大于 0")]
    ZeroQueueBytes,
}

struct Waiter {
    cost: u64,
    #[allow(dead_code)]
    enqueued_at: Instant,
    slot: oneshot::Sender<Result<AdmissionPermit, RelayError>>,
}

struct SemState {
    active: usize,
    queue: VecDeque<Waiter>,
    queued_bytes: u64,
}

struct SemaphoreInner {
    config: ArcSwap<BackPressureConfig>,
    state: Mutex<SemState>,
    admitted: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
}

/// 某一时刻的信号量快照，供观测与自适应控制读取。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackPressureSnapshot {
    /// 当前持有令牌数。
    pub active: usize,
    /// 当前排队等待者数。
    pub queued: usize,
    /// 排队等待者的累计代价账面。
    pub queued_bytes: u64,
    /// 当前并发上限。
    pub max_concurrency: usize,
    /// 历史放行总数。
    pub admitted: u64,
    /// 历史拒绝总数。
    pub rejected: u64,
    /// 历史驱逐总数。
    pub evicted: u64,
}

/// 受限并发 + 有界队列的准入原语。
///
/// # 设计背景（Why）
/// - 管道执行器需要在入口处对并发施加硬上限，并以可配置策略处置溢出；
///   单纯的计数信号量无法表达“队列有界 + 驱逐策略 + FIFO 公平”的组合。
///
/// # 逻辑解析（How）
/// - 状态（活跃数、等待队列、代价账面）由单把互斥锁守护，所有外部交互
///   在锁内序列化；锁的临界区只包含映射操作与一次非阻塞的 oneshot 发送。
/// - 恢复路径把**令牌本身**经由 oneshot 通道交给等待者：若等待者在授予后
///   已放弃（future 被丢弃），通道会在销毁时连带销毁令牌，令牌的 `Drop`
///   负责把槽位交还；因此任何退出路径上令牌都恰好释放一次。
/// - 已取消的排队等待者以“死信槽”形式惰性清理：授予时发送失败即跳过，
///   槽位继续交给下一名等待者，不会被消耗。
///
/// # 契约说明（What）
/// - `acquire` 的代价参数仅参与队列账面核算，每次放行占用一个并发槽位；
/// - `Suspend` 策略下等待者严格按入队顺序恢复；
/// - [`BackPressureSemaphore::resize`] 只影响后续放行，在途令牌不被回收。
///
/// # 风险提示（Trade-offs）
/// - 代价账面是咨询性的：`DropOldest` 在驱逐一名等待者后放行新来者，允许
///   瞬时越界，换取“新来者必定有去处”的确定性。
#[derive(Clone)]
pub struct BackPressureSemaphore {
    inner: Arc<SemaphoreInner>,
}

impl BackPressureSemaphore {
    /// 以合法配置构造信号量。
    pub fn new(config: BackPressureConfig) -> Result<Self, BackPressureConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(SemaphoreInner {
                config: ArcSwap::from_pointee(config),
                state: Mutex::new(SemState {
                    active: 0,
                    queue: VecDeque::new(),
                    queued_bytes: 0,
                }),
                admitted: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
            }),
        })
    }

    /// 申请一个并发槽位；`cost` 参与队列账面核算。
    ///
    /// 返回的令牌在任意退出路径上恰好释放一次（`Drop` 语义）。
    pub async fn acquire(&self, cost: u64) -> Result<AdmissionPermit, RelayError> {
        let rx = {
            let config = self.inner.config.load_full();
            let mut state = self.inner.state.lock();

            // 队列为空且有空位时直接放行；队列非空时让位给先到者，维持 FIFO。
            if state.active < config.max_concurrency && state.queue.is_empty() {
                state.active += 1;
                self.inner.admitted.fetch_add(1, Ordering::Relaxed);
                return Ok(AdmissionPermit {
                    inner: Some(Arc::clone(&self.inner)),
                });
            }

            if config.strategy == OverflowStrategy::Refuse {
                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(overflow_error(OverflowReason::Refused));
            }

            let queue_full = config
                .max_outstanding
                .is_some_and(|limit| state.active + state.queue.len() >= limit)
                || config
                    .max_queue_bytes
                    .is_some_and(|limit| state.queued_bytes.saturating_add(cost) > limit);

            if queue_full {
                match config.strategy {
                    OverflowStrategy::Suspend => {
                        self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(overflow_error(OverflowReason::Refused));
                    }
                    OverflowStrategy::DropNewest => {
                        self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(overflow_error(OverflowReason::DroppedNewest));
                    }
                    OverflowStrategy::DropOldest => {
                        match state.queue.pop_front() {
                            Some(evicted) => {
                                state.queued_bytes =
                                    state.queued_bytes.saturating_sub(evicted.cost);
                                self.inner.evicted.fetch_add(1, Ordering::Relaxed);
                                let _ = evicted
                                    .slot
                                    .send(Err(overflow_error(OverflowReason::DroppedOldest)));
                            }
                            // 没有可驱逐的等待者（在途额度全部被活跃令牌占用），
                            // 无法腾出位置，只能丢弃新来者。
                            None => {
                                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                                return Err(overflow_error(OverflowReason::DroppedNewest));
                            }
                        }
                    }
                    OverflowStrategy::Refuse => unreachable!("Refuse 策略在上方已返回"),
                }
            }

            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter {
                cost,
                enqueued_at: Instant::now(),
                slot: tx,
            });
            state.queued_bytes = state.queued_bytes.saturating_add(cost);
            rx
        };

        match rx.await {
            Ok(outcome) => outcome,
            // 发送端连同信号量一起消失，按拒绝处理。
            Err(_) => Err(overflow_error(OverflowReason::Refused)),
        }
    }

    /// 带取消与截止语义的申请：等待期间被取消或超过截止点时放弃排队。
    ///
    /// 放弃的等待者不消耗槽位：授予路径在发送失败时跳过该等待者；若令牌
    /// 已经进入通道，通道销毁会触发令牌的 `Drop` 将槽位交还。
    pub async fn acquire_with(
        &self,
        cost: u64,
        cancellation: &Cancellation,
        deadline: Deadline,
    ) -> Result<AdmissionPermit, RelayError> {
        let acquire = self.acquire(cost);
        tokio::pin!(acquire);
        match deadline.instant() {
            Some(instant) => {
                tokio::select! {
                    outcome = &mut acquire => outcome,
                    _ = cancellation.cancelled() => Err(RelayError::cancelled()),
                    _ = tokio::time::sleep_until(instant) => Err(RelayError::deadline_exceeded()),
                }
            }
            None => {
                tokio::select! {
                    outcome = &mut acquire => outcome,
                    _ = cancellation.cancelled() => Err(RelayError::cancelled()),
                }
            }
        }
    }

    /// 更新并发上限；只影响后续放行，在途令牌不被回收。
    ///
    /// 上调后立即按 FIFO 顺序补发空出的槽位。
    pub fn resize(&self, max_concurrency: usize) -> Result<(), BackPressureConfigError> {
        if max_concurrency == 0 {
            return Err(BackPressureConfigError::ZeroConcurrency);
        }
        let current = self.inner.config.load_full();
        let updated = Arc::new(BackPressureConfig {
            max_concurrency,
            ..(*current).clone()
        });
        self.inner.config.store(Arc::clone(&updated));
        let mut state = self.inner.state.lock();
        grant_waiters(&self.inner, &updated, &mut state);
        Ok(())
    }

    /// 当前并发上限。
    pub fn max_concurrency(&self) -> usize {
        self.inner.config.load().max_concurrency
    }

    /// 读取即时快照。
    pub fn snapshot(&self) -> BackPressureSnapshot {
        let config = self.inner.config.load();
        let state = self.inner.state.lock();
        BackPressureSnapshot {
            active: state.active,
            queued: state.queue.len(),
            queued_bytes: state.queued_bytes,
            max_concurrency: config.max_concurrency,
            admitted: self.inner.admitted.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            evicted: self.inner.evicted.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for BackPressureSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("BackPressureSemaphore")
            .field("active", &snapshot.active)
            .field("queued", &snapshot.queued)
            .field("max_concurrency", &snapshot.max_concurrency)
            .finish()
    }
}

/// 单次放行的准入令牌；`Drop` 时交还槽位并按 FIFO 补发。
pub struct AdmissionPermit {
    inner: Option<Arc<SemaphoreInner>>,
}

impl AdmissionPermit {
    /// 解除令牌与槽位的关联，仅供授予路径在锁内回收时使用。
    fn disarm(&mut self) {
        self.inner = None;
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let config = inner.config.load_full();
            let mut state = inner.state.lock();
            state.active = state.active.saturating_sub(1);
            grant_waiters(&inner, &config, &mut state);
        }
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("armed", &self.inner.is_some())
            .finish()
    }
}

fn grant_waiters(inner: &Arc<SemaphoreInner>, config: &BackPressureConfig, state: &mut SemState) {
    while state.active < config.max_concurrency {
        let Some(waiter) = state.queue.pop_front() else {
            break;
        };
        state.queued_bytes = state.queued_bytes.saturating_sub(waiter.cost);
        let permit = AdmissionPermit {
            inner: Some(Arc::clone(inner)),
        };
        match waiter.slot.send(Ok(permit)) {
            Ok(()) => {
                state.active += 1;
                inner.admitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(returned) => {
                // 等待者已放弃。必须在锁内解除关联后再丢弃令牌，
                // 否则令牌的 Drop 会重入本锁。
                if let Ok(mut permit) = returned {
                    permit.disarm();
                }
            }
        }
    }
}

fn overflow_error(reason: OverflowReason) -> RelayError {
    RelayError::new(codes::BACKPRESSURE_OVERFLOW, format!("背压溢出（{reason}）")).with_cause(reason)
}
