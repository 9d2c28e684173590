//! 命令执行上下文：每次管道调用的状态载体。
//!
//! ## 模块说明（What）
//! - [`store`]：以类型化键索引的异构共享存储；
//! - [`CommandContext`]：固定单元（请求标识、相关性标识、起始时刻、指标与
//!   注记映射、事件出口、取消与截止原语）加上类型化存储的组合体。
//!
//! ## 并发纪律（How）
//! - 类型化存储由单把互斥锁守护；固定单元要么不可变、要么各自持有专属的
//!   细粒度锁或原子量，任何路径都不会跨越中间件边界持锁。

mod store;

pub use store::{ContextKey, ContextSnapshot, ContextStore, StoreGuard};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::command::CommandMetadata;
use crate::contract::{Cancellation, Deadline};
use crate::error::RelayError;
use crate::events::{EventBus, PipelineEvent};

/// 每次管道调用的执行上下文。
///
/// # 设计背景（Why）
/// - 中间件之间既需要结构化的固定信息（请求标识、相关性标识、起始时刻），
///   也需要开放式的类型化共享存储；两者合并为一个生命周期绑定单次调用的
///   载体，调用返回即销毁。
///
/// # 契约说明（What）
/// - 固定单元在构造时确定：`request_id` 取自命令元数据，`correlation_id`
///   在元数据缺省时自动生成，保证事件始终可归组。
/// - `fork` 产出独立上下文：类型化存储做一次原子浅拷贝，指标与注记映射
///   按值复制；取消与截止原语与父上下文共享，因为分叉仍属于同一次逻辑调用。
/// - `clear` 清空类型化存储与指标、注记映射，元数据派生单元保持不变。
///
/// # 风险提示（Trade-offs）
/// - 上下文可在多任务间以引用共享；所有可变单元都有内部同步，但调用方仍应
///   避免在持有任何外部锁时调用会触达事件出口的方法。
pub struct CommandContext {
    request_id: Uuid,
    correlation_id: String,
    user_id: Option<String>,
    metadata: CommandMetadata,
    started_at: Instant,
    store: ContextStore,
    metrics: Mutex<HashMap<String, f64>>,
    annotations: Mutex<HashMap<String, String>>,
    events: Option<EventBus>,
    cancellation: Cancellation,
    deadline: Deadline,
    duplicate: AtomicBool,
}

impl CommandContext {
    /// 以命令元数据构造上下文。
    pub fn new(metadata: CommandMetadata) -> Self {
        let correlation_id = metadata
            .correlation_id()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        Self {
            request_id: metadata.id(),
            correlation_id,
            user_id: metadata.user_id().map(str::to_string),
            metadata,
            started_at: Instant::now(),
            store: ContextStore::new(),
            metrics: Mutex::new(HashMap::new()),
            annotations: Mutex::new(HashMap::new()),
            events: None,
            cancellation: Cancellation::new(),
            deadline: Deadline::none(),
            duplicate: AtomicBool::new(false),
        }
    }

    /// 附接事件总线，链路各阶段经由上下文对外发布事件。
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// 设置截止时间。
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// 替换取消令牌，常用于与外部取消源对接。
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// 获取请求标识。
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// 获取相关性标识。
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// 获取用户标识。
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// 获取命令元数据。
    pub fn metadata(&self) -> &CommandMetadata {
        &self.metadata
    }

    /// 获取起始时刻。
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// 自上下文创建以来的流逝时间。
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 访问类型化共享存储。
    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    /// 获取取消令牌。
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// 获取截止时间。
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// 获取事件总线句柄。
    pub fn events(&self) -> Option<&EventBus> {
        self.events.as_ref()
    }

    /// 校验调用仍然存活：未被取消且未超过截止时间。
    ///
    /// # 契约说明（What）
    /// - 取消优先于截止：两者同时成立时返回取消错误，保持因果语义。
    pub fn ensure_live(&self) -> Result<(), RelayError> {
        if self.cancellation.is_cancelled() {
            return Err(RelayError::cancelled().with_correlation_id(self.correlation_id.clone()));
        }
        if self.deadline.is_expired() {
            return Err(
                RelayError::deadline_exceeded().with_correlation_id(self.correlation_id.clone())
            );
        }
        Ok(())
    }

    /// 经由上下文发布事件：补齐相关性标识后交给事件总线。
    ///
    /// 未附接总线时静默丢弃，发布方无需感知观测拓扑。
    pub fn emit(&self, event: PipelineEvent) {
        if let Some(bus) = &self.events {
            bus.emit(event.with_correlation_id(self.correlation_id.clone()));
        }
    }

    /// 记录数值指标；同名指标整体覆盖。
    pub fn record_metric(&self, name: impl Into<String>, value: f64) {
        self.metrics.lock().insert(name.into(), value);
    }

    /// 读取指标值。
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.lock().get(name).copied()
    }

    /// 拷贝当前全部指标。
    pub fn metrics_snapshot(&self) -> HashMap<String, f64> {
        self.metrics.lock().clone()
    }

    /// 写入字符串注记。
    pub fn set_annotation(&self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations.lock().insert(key.into(), value.into());
    }

    /// 读取字符串注记。
    pub fn annotation(&self, key: &str) -> Option<String> {
        self.annotations.lock().get(key).cloned()
    }

    /// 标记本次命令为窗口内重复。
    pub fn mark_duplicate(&self) {
        self.duplicate.store(true, Ordering::Release);
    }

    /// 查询重复标记。
    pub fn is_duplicate(&self) -> bool {
        self.duplicate.load(Ordering::Acquire)
    }

    /// 分叉出独立上下文：存储浅拷贝、映射按值复制、取消与截止共享。
    pub fn fork(&self) -> CommandContext {
        CommandContext {
            request_id: self.request_id,
            correlation_id: self.correlation_id.clone(),
            user_id: self.user_id.clone(),
            metadata: self.metadata.clone(),
            started_at: self.started_at,
            store: self.store.fork(),
            metrics: Mutex::new(self.metrics.lock().clone()),
            annotations: Mutex::new(self.annotations.lock().clone()),
            events: self.events.clone(),
            cancellation: self.cancellation.clone(),
            deadline: self.deadline,
            duplicate: AtomicBool::new(self.duplicate.load(Ordering::Acquire)),
        }
    }

    /// 清空类型化存储与指标、注记映射；元数据派生单元保持不变。
    pub fn clear(&self) {
        self.store.clear();
        self.metrics.lock().clear();
        self.annotations.lock().clear();
    }
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("request_id", &self.request_id)
            .field("correlation_id", &self.correlation_id)
            .field("entries", &self.store.len())
            .field("duplicate", &self.is_duplicate())
            .finish()
    }
}
