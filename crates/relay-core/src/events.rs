use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::RelayError;

/// 管道事件：各阶段经由上下文对外发布的标准化信号。
///
/// # 契约说明（What）
/// - `kind` 为稳定事件名，内置取值集中在 [`kinds`] 模块；
/// - `sequence` 由总线在发布时分配，进程内单调递增（宽松序，竞争发布者之间
///   不保证全局先后）；
/// - 事件对象应视为不可变；若需修改请构造新事件。
#[derive(Clone, Debug)]
pub struct PipelineEvent {
    kind: Cow<'static, str>,
    correlation_id: String,
    sequence: u64,
    occurred_at: SystemTime,
    attributes: Vec<(Cow<'static, str>, String)>,
}

impl PipelineEvent {
    /// 以事件名构造事件；相关性标识由上下文在发布时补齐。
    pub fn new(kind: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: kind.into(),
            correlation_id: String::new(),
            sequence: 0,
            occurred_at: SystemTime::now(),
            attributes: Vec::new(),
        }
    }

    /// 设置相关性标识。
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// 追加结构化标签。
    pub fn with_attribute(
        mut self,
        key: impl Into<Cow<'static, str>>,
        value: impl Into<String>,
    ) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    /// 获取事件名。
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// 获取相关性标识。
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// 获取发布序号。
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// 获取发布时刻（壁钟）。
    pub fn occurred_at(&self) -> SystemTime {
        self.occurred_at
    }

    /// 按键读取标签。
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// 访问全部标签。
    pub fn attributes(&self) -> &[(Cow<'static, str>, String)] {
        &self.attributes
    }
}

/// 内置事件名常量，保证观测系统具有稳定识别符。
pub mod kinds {
    /// 管道开始执行。
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    /// 管道成功完成。
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    /// 管道以错误结束。
    pub const PIPELINE_FAILED: &str = "pipeline.failed";
    /// 中间件进入执行。
    pub const MIDDLEWARE_ENTERED: &str = "middleware.entered";
    /// 缓存命中。
    pub const CACHE_HIT: &str = "cache.hit";
    /// 缓存未命中。
    pub const CACHE_MISS: &str = "cache.miss";
    /// 缓存写入完成。
    pub const CACHE_STORED: &str = "cache.stored";
    /// 指纹窗口内发现重复命令。
    pub const DEDUP_DUPLICATE: &str = "dedup.duplicate";
    /// 熔断器进入打开状态。
    pub const BREAKER_OPENED: &str = "breaker.opened";
    /// 熔断器恢复关闭状态。
    pub const BREAKER_CLOSED: &str = "breaker.closed";
    /// 熔断器进入半开探测。
    pub const BREAKER_HALF_OPEN: &str = "breaker.half_open";
    /// 发起一次重试。
    pub const RETRY_ATTEMPTED: &str = "retry.attempted";
}

/// 事件订阅者契约。
///
/// # 契约说明（What）
/// - `on_event` 的失败只计入统计并记录调试日志，总线不会重试投递；
/// - 订阅者由弱引用持有，外部生命周期结束后由周期清扫移除，总线不会
///   延长订阅者的存活期。
#[async_trait]
pub trait EventSubscriber: Send + Sync + 'static {
    /// 处理一条事件。
    async fn on_event(&self, event: PipelineEvent) -> Result<(), RelayError>;

    /// 订阅者的稳定名称，用于诊断日志。
    fn subscriber_name(&self) -> &str {
        "anonymous.subscriber"
    }
}

/// 事件总线配置。
#[derive(Clone, Copy, Debug)]
pub struct EventBusConfig {
    /// 周期清扫死亡订阅的间隔。
    pub cleanup_interval: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

struct SubscriberSlot {
    addr: usize,
    subscriber: Weak<dyn EventSubscriber>,
    outbox: mpsc::UnboundedSender<PipelineEvent>,
}

struct BusInner {
    slots: RwLock<Vec<SubscriberSlot>>,
    sequence: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    reaped: AtomicU64,
}

/// 事件投递统计。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventBusStats {
    /// 成功投递的事件数。
    pub delivered: u64,
    /// 订阅者处理失败的事件数。
    pub failed: u64,
    /// 被清扫移除的死亡订阅数。
    pub reaped: u64,
}

/// 即发即忘的发布/订阅总线，弱引用持有订阅者。
///
/// # 设计背景（Why）
/// - 观测者与被观测者互相持有强引用会形成环；订阅侧因此一律使用弱引用，
///   配合周期清扫移除死亡条目，总线永远不会把订阅者的生命周期延长到其
///   外部持有者之后。
///
/// # 逻辑解析（How）
/// - 每个订阅者持有一条专属无界队列与一个派发任务：`emit` 在调用方任务内
///   同步分配序号并依序入队（耗时与订阅者数量成正比），实际投递由各派发
///   任务并发完成。队列保证**同一订阅者**观察到的顺序与发布顺序一致；
///   不同订阅者之间的先后不作保证。
/// - 派发任务在升级弱引用失败或队列关闭时自行退出；清扫只负责移除注册表
///   中的死亡条目并关闭其队列。
///
/// # 契约说明（What）
/// - `emit` 快速返回、从不阻塞；订阅者处理失败只计入统计；
/// - `subscribe`/`unsubscribe` 以订阅者身份（指针地址）为键；
/// - 构造与订阅必须发生在异步运行时内（派发与清扫任务依赖任务调度器）。
///
/// # 风险提示（Trade-offs）
/// - 无界队列换取 `emit` 的非阻塞性；慢订阅者会积压内存，调用方应监控
///   [`EventBusStats`] 并对慢消费者降级。
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// 以默认配置创建总线。
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    /// 以指定配置创建总线，并在运行时可用时启动周期清扫任务。
    pub fn with_config(config: EventBusConfig) -> Self {
        let bus = Self {
            inner: Arc::new(BusInner {
                slots: RwLock::new(Vec::new()),
                sequence: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                reaped: AtomicU64::new(0),
            }),
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&bus.inner);
            let interval = config.cleanup_interval;
            handle.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    match weak.upgrade() {
                        Some(inner) => {
                            let removed = reap_slots(&inner);
                            if removed > 0 {
                                tracing::debug!(removed, "event bus 清扫了死亡订阅");
                            }
                        }
                        None => break,
                    }
                }
            });
        }
        bus
    }

    /// 注册订阅者；重复注册同一实例会产生重复投递，调用方自行避免。
    pub fn subscribe<S: EventSubscriber>(&self, subscriber: &Arc<S>) {
        let dynamic: Arc<dyn EventSubscriber> = Arc::clone(subscriber) as Arc<dyn EventSubscriber>;
        let addr = Arc::as_ptr(subscriber) as *const () as usize;
        let weak = Arc::downgrade(&dynamic);
        let (tx, mut rx) = mpsc::unbounded_channel::<PipelineEvent>();

        let consumer_weak = weak.clone();
        let stats = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(subscriber) = consumer_weak.upgrade() else {
                    break;
                };
                let outcome = subscriber.on_event(event).await;
                if let Some(inner) = stats.upgrade() {
                    match outcome {
                        Ok(()) => {
                            inner.delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(error) => {
                            inner.failed.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(
                                subscriber = subscriber.subscriber_name(),
                                code = error.code(),
                                "事件订阅者处理失败，不重试"
                            );
                        }
                    }
                }
            }
        });

        self.inner.slots.write().push(SubscriberSlot {
            addr,
            subscriber: weak,
            outbox: tx,
        });
    }

    /// 按身份注销订阅者；未注册时为空操作。
    pub fn unsubscribe<S: EventSubscriber>(&self, subscriber: &Arc<S>) {
        let addr = Arc::as_ptr(subscriber) as *const () as usize;
        self.inner.slots.write().retain(|slot| slot.addr != addr);
    }

    /// 当前存活订阅者数量。
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .slots
            .read()
            .iter()
            .filter(|slot| slot.subscriber.strong_count() > 0)
            .count()
    }

    /// 发布事件：同步分配序号并依序入队，投递异步完成。
    pub fn emit(&self, mut event: PipelineEvent) {
        event.sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let slots = self.inner.slots.read();
        for slot in slots.iter() {
            if slot.subscriber.strong_count() == 0 {
                continue;
            }
            // 发送失败意味着派发任务已退出，留待清扫移除。
            let _ = slot.outbox.send(event.clone());
        }
    }

    /// 立即清扫死亡订阅，返回移除数量；清扫任务周期性调用同一逻辑。
    pub fn reap_now(&self) -> usize {
        reap_slots(&self.inner)
    }

    /// 读取投递统计。
    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            reaped: self.inner.reaped.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn reap_slots(inner: &BusInner) -> usize {
    let mut slots = inner.slots.write();
    let before = slots.len();
    slots.retain(|slot| slot.subscriber.strong_count() > 0);
    let removed = before - slots.len();
    if removed > 0 {
        inner.reaped.fetch_add(removed as u64, Ordering::Relaxed);
    }
    removed
}
