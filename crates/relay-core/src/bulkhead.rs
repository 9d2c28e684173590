use std::borrow::Cow;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::contract::{Cancellation, Deadline};
use crate::error::{RelayError, codes};

/// 隔板配置。
#[derive(Clone, Copy, Debug)]
pub struct BulkheadConfig {
    /// 并发执行槽位上限。
    pub max_concurrency: usize,
    /// 等待者数量上限，超出即 `bulkhead.full`。
    pub max_waiting: usize,
}

impl BulkheadConfig {
    /// 校验配置合法性。
    pub fn validate(&self) -> Result<(), BulkheadConfigError> {
        if self.max_concurrency == 0 {
            return Err(BulkheadConfigError::ZeroConcurrency);
        }
        Ok(())
    }
}

/// 隔板配置校验错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum BulkheadConfigError {
    #[error("max_concurrency 必须大于 0")]
    ZeroConcurrency,
}

struct BulkheadState {
    active: usize,
    waiters: VecDeque<oneshot::Sender<BulkheadPermit>>,
}

struct BulkheadInner {
    name: Cow<'static, str>,
    config: BulkheadConfig,
    state: Mutex<BulkheadState>,
}

/// 隔离并发池：为某一类操作划出独立槽位，限定故障的波及面。
///
/// # 逻辑解析（How）
/// - 槽位与等待队列由单把互斥锁守护；等待者按 FIFO 恢复。
/// - 与背压信号量同构，恢复路径把令牌本身经 oneshot 通道交给等待者：
///   等待者若已放弃（future 被丢弃），通道销毁触发令牌 `Drop` 交还槽位，
///   已取消的排队等待者在授予时被跳过，不消耗槽位。
///
/// # 契约说明（What）
/// - 等待者数量超过 `max_waiting` 时，新来者以 [`codes::BULKHEAD_FULL`] 失败；
/// - 令牌在任意退出路径上恰好释放一次。
#[derive(Clone)]
pub struct Bulkhead {
    inner: Arc<BulkheadInner>,
}

impl Bulkhead {
    /// 以名称与合法配置构造隔板。
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        config: BulkheadConfig,
    ) -> Result<Self, BulkheadConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(BulkheadInner {
                name: name.into(),
                config,
                state: Mutex::new(BulkheadState {
                    active: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        })
    }

    /// 获取隔板名称。
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 申请一个执行槽位，必要时 FIFO 排队。
    pub async fn acquire(&self) -> Result<BulkheadPermit, RelayError> {
        let rx = {
            let mut state = self.inner.state.lock();
            if state.active < self.inner.config.max_concurrency && state.waiters.is_empty() {
                state.active += 1;
                return Ok(BulkheadPermit {
                    inner: Some(Arc::clone(&self.inner)),
                });
            }
            if state.waiters.len() >= self.inner.config.max_waiting {
                return Err(RelayError::new(
                    codes::BULKHEAD_FULL,
                    format!("隔板 {} 的等待者数量已达上限", self.inner.name),
                ));
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        rx.await.map_err(|_| {
            RelayError::new(
                codes::BULKHEAD_FULL,
                format!("隔板 {} 在等待期间被关闭", self.inner.name),
            )
        })
    }

    /// 带取消与截止语义的申请。
    pub async fn acquire_with(
        &self,
        cancellation: &Cancellation,
        deadline: Deadline,
    ) -> Result<BulkheadPermit, RelayError> {
        let acquire = self.acquire();
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

    /// 在槽位保护下执行操作；任意退出路径都会交还槽位。
    pub async fn execute<T, F>(&self, op: F) -> Result<T, RelayError>
    where
        F: Future<Output = Result<T, RelayError>>,
    {
        let _permit = self.acquire().await?;
        op.await
    }

    /// 当前活跃执行数。
    pub fn active(&self) -> usize {
        self.inner.state.lock().active
    }

    /// 当前排队等待数。
    pub fn waiting(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.inner.name)
            .field("active", &self.active())
            .field("waiting", &self.waiting())
            .finish()
    }
}

/// 隔板执行槽位令牌；`Drop` 时交还并按 FIFO 补发。
pub struct BulkheadPermit {
    inner: Option<Arc<BulkheadInner>>,
}

impl BulkheadPermit {
    fn disarm(&mut self) {
        self.inner = None;
    }
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let mut state = inner.state.lock();
            state.active = state.active.saturating_sub(1);
            while state.active < inner.config.max_concurrency {
                let Some(waiter) = state.waiters.pop_front() else {
                    break;
                };
                let permit = BulkheadPermit {
                    inner: Some(Arc::clone(&inner)),
                };
                match waiter.send(permit) {
                    Ok(()) => {
                        state.active += 1;
                    }
                    Err(mut returned) => {
                        // 等待者已放弃；锁内必须先解除关联再丢弃，避免重入。
                        returned.disarm();
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for BulkheadPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkheadPermit")
            .field("armed", &self.inner.is_some())
            .finish()
    }
}
