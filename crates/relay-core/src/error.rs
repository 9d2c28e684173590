use core::fmt;

/// `RelayError` 是命令管道内核的统一错误域。
///
/// # 设计背景（Why）
/// - 管道内核需要跨中间件传递稳定的错误码，以便日志、指标与告警系统能够进行
///   机器可读的根因识别；人类可读的消息只用于调试，不构成契约。
/// - 错误必须能够携带底层原因形成链路，并且可以附带相关性标识以串联同一次
///   逻辑请求产生的所有事件。
///
/// # 逻辑解析（How）
/// - 结构体以 Builder 风格的方法累积上下文，例如 `with_cause`、`with_correlation_id`。
/// - `code` 字段承载稳定错误码，`message` 面向人类调试；判定类方法
///   （`is_cancellation`、`is_deadline` 等）只依据错误码，保证分类结果稳定。
///
/// # 契约说明（What）
/// - **前置条件**：调用方应保证错误码在 [`codes`] 模块中声明，或遵守约定的
///   `domain.reason` 命名形式。
/// - **后置条件**：所有构造方法都会产生 `RelayError` 拥有的所有权，可跨线程
///   移动、可安全地在重试循环中保存。
///
/// # 设计取舍与风险（Trade-offs）
/// - 采用 `String` 储存消息，牺牲少量拷贝成本换取在日志与跨组件通信上的灵活性。
/// - 相关性标识为可选字段，单机或测试场景无需付出额外成本。
#[derive(Debug)]
pub struct RelayError {
    code: &'static str,
    message: String,
    cause: Option<ErrorCause>,
    correlation_id: Option<String>,
}

/// `ErrorCause` 封装底层原因，保持 `Send + Sync` 以方便跨任务传递。
pub type ErrorCause = Box<dyn std::error::Error + Send + Sync + 'static>;

impl RelayError {
    /// 使用稳定错误码与消息创建 `RelayError`。
    ///
    /// # 契约说明
    /// - **参数**：`code` 必须是全局唯一且稳定的字符串；`message` 为任意人类可读文本。
    /// - **前置条件**：`code` 应遵循 `domain.reason` 命名；`message` 建议避免敏感信息。
    /// - **后置条件**：返回的实例尚未附带任何补充上下文。
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            correlation_id: None,
        }
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取人类可读的错误描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 附带一个底层原因，形成错误链。
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 附带相关性标识，串联同一次逻辑请求的事件与日志。
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// 获取可选的底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 获取可选的相关性标识。
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// 构造协作式取消错误。
    pub fn cancelled() -> Self {
        Self::new(codes::CANCELLED, "操作已被协作式取消")
    }

    /// 构造截止时间超限错误。
    pub fn deadline_exceeded() -> Self {
        Self::new(codes::DEADLINE_EXCEEDED, "截止时间已到，放弃继续执行")
    }

    /// 判断是否为取消类错误。
    pub fn is_cancellation(&self) -> bool {
        self.code == codes::CANCELLED
    }

    /// 判断是否为截止时间类错误。
    pub fn is_deadline(&self) -> bool {
        self.code == codes::DEADLINE_EXCEEDED
    }

    /// 判断是否为背压溢出错误。
    pub fn is_overflow(&self) -> bool {
        self.code == codes::BACKPRESSURE_OVERFLOW
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|boxed| boxed.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// 框架内置的错误码常量集合，确保可观测性系统具有稳定识别符。
pub mod codes {
    /// 输入违反前置校验。
    pub const VALIDATION_FAILED: &str = "validation.failed";
    /// 凭证缺失或权限不足。
    pub const AUTH_UNAUTHORIZED: &str = "auth.unauthorized";
    /// 速率限额耗尽。
    pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit.exceeded";
    /// 背压队列或并发上限溢出。
    pub const BACKPRESSURE_OVERFLOW: &str = "backpressure.overflow";
    /// 熔断器处于打开状态。
    pub const BREAKER_OPEN: &str = "breaker.open";
    /// 隔板等待者数量超限。
    pub const BULKHEAD_FULL: &str = "bulkhead.full";
    /// 截止时间已到。
    pub const DEADLINE_EXCEEDED: &str = "deadline.exceeded";
    /// 协作式取消。
    pub const CANCELLED: &str = "execution.cancelled";
    /// 重试次数耗尽。
    pub const RETRY_EXHAUSTED: &str = "retry.exhausted";
    /// 重试总时长预算耗尽。
    pub const RETRY_BUDGET_EXHAUSTED: &str = "retry.budget_exhausted";
    /// 链路深度超过构建期上限。
    pub const CHAIN_DEPTH_EXCEEDED: &str = "chain.depth_exceeded";
    /// 继续函数被调用了两次。
    pub const NEXT_CALLED_TWICE: &str = "chain.next_called_twice";
    /// 继续函数在释放后仍被调用。
    pub const NEXT_AFTER_RELEASE: &str = "chain.next_after_release";
    /// 指纹窗口内的重复命令。
    pub const DUPLICATE_COMMAND: &str = "dedup.duplicate";
    /// 幂等键对应的执行仍在进行中。
    pub const OPERATION_IN_PROGRESS: &str = "idempotency.in_progress";
    /// 缓存字节解码失败（软错误，按未命中恢复）。
    pub const CACHE_DECODE: &str = "cache.decode";
    /// 兜底的执行失败包装。
    pub const EXECUTION_FAILED: &str = "execution.failed";
}
