use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

/// 轻量追踪上下文，标识一次逻辑请求及其中的当前跨度。
///
/// # 设计背景（Why）
/// - 审计与事件系统需要在不显式传参的情况下取得“当前在哪条链路、哪个跨度”
///   的信息；上下文因此保持最小字段集，复制成本为两次短字符串克隆。
///
/// # 契约说明（What）
/// - `trace_id` 在整条链路内稳定；`child` 派生新的 `span_id` 并保留 `trace_id`。
/// - 标识符为随机生成的紧凑十六进制串，不承诺与任何外部追踪协议位级兼容。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceContext {
    trace_id: String,
    span_id: String,
}

impl TraceContext {
    /// 生成全新的追踪上下文。
    pub fn generate() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: short_id(),
        }
    }

    /// 以既有标识构造上下文，供跨进程透传场景使用。
    pub fn from_parts(trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
        }
    }

    /// 获取链路标识。
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// 获取当前跨度标识。
    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// 派生子上下文：沿用链路标识，生成新的跨度标识。
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: short_id(),
        }
    }
}

fn short_id() -> String {
    let full = Uuid::new_v4().simple().to_string();
    full[..16].to_string()
}

/// 跨度结束时的结果标记。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SpanOutcome {
    /// 正常完成。
    Success,
    /// 以错误结束。
    Failure,
}

/// 单个跨度：一段具名的、可嵌套的执行区间。
///
/// # 契约说明（What）
/// - `start` 记录创建时刻；`finish` 幂等地写入结束时刻与结果，重复调用只保留
///   首次结果。
/// - `parent_id` 为空表示根跨度。
#[derive(Clone, Debug)]
pub struct Span {
    id: String,
    name: String,
    started_at: Instant,
    ended_at: Option<Instant>,
    parent_id: Option<String>,
    outcome: Option<SpanOutcome>,
}

impl Span {
    /// 开启新的跨度。
    pub fn start(name: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            id: short_id(),
            name: name.into(),
            started_at: Instant::now(),
            ended_at: None,
            parent_id,
            outcome: None,
        }
    }

    /// 获取跨度标识。
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 获取跨度名称。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 获取父跨度标识。
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    /// 获取结束结果。
    pub fn outcome(&self) -> Option<SpanOutcome> {
        self.outcome
    }

    /// 结束跨度并记录结果；重复调用保持首次结果不变。
    pub fn finish(&mut self, outcome: SpanOutcome) {
        if self.ended_at.is_none() {
            self.ended_at = Some(Instant::now());
            self.outcome = Some(outcome);
        }
    }

    /// 跨度持续时长；未结束时返回到当前时刻的流逝时间。
    pub fn elapsed(&self) -> Duration {
        match self.ended_at {
            Some(end) => end.saturating_duration_since(self.started_at),
            None => self.started_at.elapsed(),
        }
    }

    /// 是否已结束。
    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// 一次逻辑请求的跨度集合，按开启顺序排列。
#[derive(Clone, Debug)]
pub struct Trace {
    correlation_id: String,
    spans: Vec<Span>,
    started_at: Instant,
    ended_at: Option<Instant>,
}

impl Trace {
    /// 以相关性标识开启新链路。
    pub fn begin(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            spans: Vec::new(),
            started_at: Instant::now(),
            ended_at: None,
        }
    }

    /// 获取相关性标识。
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// 追加跨度，保持开启顺序。
    pub fn push_span(&mut self, span: Span) {
        self.spans.push(span);
    }

    /// 按开启顺序访问跨度。
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// 结束整条链路；幂等。
    pub fn finish(&mut self) {
        if self.ended_at.is_none() {
            self.ended_at = Some(Instant::now());
        }
    }

    /// 链路总时长；未结束时返回到当前时刻的流逝时间。
    pub fn elapsed(&self) -> Duration {
        match self.ended_at {
            Some(end) => end.saturating_duration_since(self.started_at),
            None => self.started_at.elapsed(),
        }
    }
}

tokio::task_local! {
    /// 任务本地的追踪上下文，供审计与事件系统隐式取用。
    static CURRENT_TRACE: TraceContext;
}

/// 在给定追踪上下文的作用域内执行 Future。
///
/// # 逻辑解析（How）
/// - 上下文通过任务本地存储向下传播，被包裹的 Future 及其同任务内的同步调用
///   均可通过 [`current_trace_context`] 读取；跨 `tokio::spawn` 边界不自动继承，
///   需要在派生任务处再次包裹。
pub async fn with_trace_context<F>(ctx: TraceContext, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_TRACE.scope(ctx, fut).await
}

/// 读取当前任务的追踪上下文；作用域之外返回 `None`。
pub fn current_trace_context() -> Option<TraceContext> {
    CURRENT_TRACE.try_with(|ctx| ctx.clone()).ok()
}
