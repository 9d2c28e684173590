use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::error::RelayError;
use crate::trace::current_trace_context;

/// 审计事件：不可变、可序列化的业务动作记录。
///
/// # 契约说明（What）
/// - `event_type` 为稳定事件名；`occurred_at_ms` 为毫秒级 Unix 时间戳；
/// - 进入漏斗时若存在任务本地追踪上下文，则自动以 `trace_id/span_id`
///   充实事件；已显式设置的字段不被覆盖。
#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    /// 稳定事件名。
    pub event_type: String,
    /// 毫秒级 Unix 时间戳。
    pub occurred_at_ms: u64,
    /// 结构化元数据，键序确定。
    pub metadata: BTreeMap<String, String>,
    /// 链路标识。
    pub trace_id: Option<String>,
    /// 跨度标识。
    pub span_id: Option<String>,
    /// 用户标识。
    pub user_id: Option<String>,
    /// 会话标识。
    pub session_id: Option<String>,
}

impl AuditEvent {
    /// 以事件名构造事件，时间戳取当前壁钟。
    pub fn new(event_type: impl Into<String>) -> Self {
        let occurred_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            event_type: event_type.into(),
            occurred_at_ms,
            metadata: BTreeMap::new(),
            trace_id: None,
            span_id: None,
            user_id: None,
            session_id: None,
        }
    }

    /// 追加元数据键值。
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 设置用户标识。
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// 设置会话标识。
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// 以当前任务本地追踪上下文充实事件；已设置的字段保持不变。
    pub fn enriched_from_trace(mut self) -> Self {
        if let Some(trace) = current_trace_context() {
            if self.trace_id.is_none() {
                self.trace_id = Some(trace.trace_id().to_string());
            }
            if self.span_id.is_none() {
                self.span_id = Some(trace.span_id().to_string());
            }
        }
        self
    }
}

/// 审计落地端契约：单方法、可失败。
///
/// # 契约说明（What）
/// - `log` 由漏斗的消费任务串行调用；失败通过健康通道对外报告，漏斗不
///   重试，事件按丢弃处理。
pub trait AuditSink: Send + Sync + 'static {
    /// 落地一条事件。
    fn log(&self, event: &AuditEvent) -> Result<(), RelayError>;
}

/// 漏斗健康信号。
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum LoggerHealthEvent {
    /// 事件被丢弃；`count` 为累计丢弃总数。
    Dropped {
        /// 累计丢弃总数。
        count: u64,
        /// 丢弃原因。
        reason: Cow<'static, str>,
    },
    /// 队列积压越过水位线。
    Backpressure {
        /// 当前队列深度。
        queue_depth: usize,
    },
    /// 落地端失败。
    SinkFailure {
        /// 失败错误码。
        code: String,
    },
    /// 落地端恢复。
    Recovered,
}

/// 审计漏斗配置。
#[derive(Clone, Copy, Debug)]
pub struct AuditFunnelConfig {
    /// 队列容量。
    pub capacity: usize,
    /// 触发积压信号的深度占比，取值 `(0, 1]`。
    pub backpressure_ratio: f64,
}

impl Default for AuditFunnelConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            backpressure_ratio: 0.8,
        }
    }
}

/// 面向落地端解耦的审计事件漏斗。
///
/// # 设计背景（Why）
/// - 业务路径上的审计写入必须既不抛错也不阻塞；漏斗以有界队列把事件交给
///   独立消费任务，队列满时丢弃并通过健康通道告知运维面。
///
/// # 逻辑解析（How）
/// - `log` 先以任务本地追踪上下文充实事件，再非阻塞入队：队满即丢弃并
///   累计 `Dropped`；深度越过水位线时补发 `Backpressure` 信号。
/// - 消费任务串行调用落地端：失败发布 `SinkFailure`，恢复后补发
///   `Recovered`；落地失败的事件不重试。
pub struct AuditFunnel {
    tx: mpsc::Sender<AuditEvent>,
    health: broadcast::Sender<LoggerHealthEvent>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
    backpressure_depth: usize,
}

impl AuditFunnel {
    /// 以落地端与配置构造漏斗并启动消费任务。
    pub fn new(sink: Arc<dyn AuditSink>, config: AuditFunnelConfig) -> Self {
        let capacity = config.capacity.max(1);
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(capacity);
        let (health, _) = broadcast::channel(64);
        let consumer_health = health.clone();

        tokio::spawn(async move {
            let mut failing = false;
            while let Some(event) = rx.recv().await {
                match sink.log(&event) {
                    Ok(()) => {
                        if failing {
                            failing = false;
                            let _ = consumer_health.send(LoggerHealthEvent::Recovered);
                        }
                    }
                    Err(error) => {
                        if !failing {
                            failing = true;
                        }
                        tracing::warn!(code = error.code(), "审计落地端写入失败，事件按丢弃处理");
                        let _ = consumer_health.send(LoggerHealthEvent::SinkFailure {
                            code: error.code().to_string(),
                        });
                    }
                }
            }
        });

        let ratio = config.backpressure_ratio.clamp(f64::MIN_POSITIVE, 1.0);
        Self {
            tx,
            health,
            dropped: Arc::new(AtomicU64::new(0)),
            capacity,
            backpressure_depth: ((capacity as f64) * ratio).ceil() as usize,
        }
    }

    /// 非阻塞、不抛错地提交一条事件。
    pub fn log(&self, event: AuditEvent) {
        let event = event.enriched_from_trace();

        let queue_depth = self.capacity.saturating_sub(self.tx.capacity());
        if queue_depth >= self.backpressure_depth {
            let _ = self
                .health
                .send(LoggerHealthEvent::Backpressure { queue_depth });
        }

        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                let _ = self.health.send(LoggerHealthEvent::Dropped {
                    count: total,
                    reason: Cow::Borrowed("queue_full"),
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                let _ = self.health.send(LoggerHealthEvent::Dropped {
                    count: total,
                    reason: Cow::Borrowed("consumer_gone"),
                });
            }
        }
    }

    /// 订阅健康信号。
    pub fn health(&self) -> broadcast::Receiver<LoggerHealthEvent> {
        self.health.subscribe()
    }

    /// 累计丢弃总数。
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for AuditFunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditFunnel")
            .field("capacity", &self.capacity)
            .field("dropped", &self.dropped_total())
            .finish()
    }
}

/// 以 `tracing` 为落地端的参考实现。
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log(&self, event: &AuditEvent) -> Result<(), RelayError> {
        match serde_json::to_string(event) {
            Ok(payload) => {
                tracing::info!(target: "relay::audit", %payload, "audit event");
                Ok(())
            }
            Err(error) => Err(RelayError::new(
                crate::error::codes::EXECUTION_FAILED,
                "审计事件序列化失败",
            )
            .with_cause(error)),
        }
    }
}
