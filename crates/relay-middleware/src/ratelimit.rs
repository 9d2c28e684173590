use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;

use relay_core::chain::{ExecutionPriority, Middleware, Next};
use relay_core::command::Command;
use relay_core::context::CommandContext;
use relay_core::error::{RelayError, codes};
use relay_core::ratelimit::RateLimiter;

/// 限速中间件配置。
#[derive(Clone, Debug)]
pub struct RateLimitMiddlewareConfig {
    /// 组件稳定名称。
    pub name: Cow<'static, str>,
    /// 链路档位；缺省位于鉴权与校验之间。
    pub priority: ExecutionPriority,
    /// 单次调用的代价。
    pub cost: u64,
}

impl Default for RateLimitMiddlewareConfig {
    fn default() -> Self {
        Self {
            name: Cow::Borrowed("relay.middleware.ratelimit"),
            priority: ExecutionPriority::Custom(150),
            cost: 1,
        }
    }
}

/// 按标识限速的中间件。
///
/// # 契约说明（What）
/// - 标识由注入的提取器从命令与上下文计算（常见取用户标识或命令键）；
/// - 拒绝以 [`codes::RATE_LIMIT_EXCEEDED`] 表达，消息携带限额视图
///   （上限、剩余、恢复时点），便于上层转译为协议层的退避提示。
pub struct RateLimitMiddleware<C: Command> {
    limiter: Arc<dyn RateLimiter>,
    identifier: Arc<dyn Fn(&C, &CommandContext) -> String + Send + Sync>,
    config: RateLimitMiddlewareConfig,
}

impl<C: Command> RateLimitMiddleware<C> {
    /// 以限速器与标识提取器构造组件。
    pub fn new(
        limiter: Arc<dyn RateLimiter>,
        identifier: impl Fn(&C, &CommandContext) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            limiter,
            identifier: Arc::new(identifier),
            config: RateLimitMiddlewareConfig::default(),
        }
    }

    /// 覆盖配置。
    pub fn with_config(mut self, config: RateLimitMiddlewareConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl<C: Command> Middleware<C> for RateLimitMiddleware<C> {
    fn priority(&self) -> ExecutionPriority {
        self.config.priority
    }

    fn name(&self) -> Cow<'static, str> {
        self.config.name.clone()
    }

    fn suppress_missing_next_warning(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        command: C,
        ctx: &CommandContext,
        next: Next<'_, C>,
    ) -> Result<C::Result, RelayError> {
        let identifier = (self.identifier)(&command, ctx);
        if self.limiter.allow(&identifier, self.config.cost) {
            return next.run(command, ctx).await;
        }
        let status = self.limiter.status(&identifier);
        Err(RelayError::new(
            codes::RATE_LIMIT_EXCEEDED,
            format!(
                "标识 {identifier} 的速率限额耗尽（limit={}, remaining={}）",
                status.limit, status.remaining
            ),
        ))
    }
}

impl<C: Command> std::fmt::Debug for RateLimitMiddleware<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitMiddleware")
            .field("name", &self.config.name)
            .field("cost", &self.config.cost)
            .finish_non_exhaustive()
    }
}
