use std::borrow::Cow;

use async_trait::async_trait;
use tokio::time::Instant;

use relay_core::chain::{ExecutionPriority, Middleware, Next};
use relay_core::command::Command;
use relay_core::context::CommandContext;
use relay_core::error::RelayError;

/// 日志中间件配置。
#[derive(Clone, Debug)]
pub struct LoggingMiddlewareConfig {
    /// 组件稳定名称。
    pub name: Cow<'static, str>,
    /// 链路档位；缺省位于最外层。
    pub priority: ExecutionPriority,
}

impl Default for LoggingMiddlewareConfig {
    fn default() -> Self {
        Self {
            name: Cow::Borrowed("relay.middleware.logging"),
            priority: ExecutionPriority::Custom(50),
        }
    }
}

/// 进入/返回/出错三类链路日志的打点组件。
///
/// # 契约说明（What）
/// - 日志只携带低基数字段（相关性标识、错误码、耗时毫秒），不落命令内容；
/// - 组件透明转发命令与结果，不改写任何语义。
#[derive(Clone, Debug, Default)]
pub struct LoggingMiddleware {
    config: LoggingMiddlewareConfig,
}

impl LoggingMiddleware {
    /// 以配置构造组件。
    pub fn new(config: LoggingMiddlewareConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl<C: Command> Middleware<C> for LoggingMiddleware {
    fn priority(&self) -> ExecutionPriority {
        self.config.priority
    }

    fn name(&self) -> Cow<'static, str> {
        self.config.name.clone()
    }

    async fn execute(
        &self,
        command: C,
        ctx: &CommandContext,
        next: Next<'_, C>,
    ) -> Result<C::Result, RelayError> {
        let started = Instant::now();
        tracing::debug!(
            correlation_id = ctx.correlation_id(),
            request_id = %ctx.request_id(),
            "命令进入链路"
        );
        let result = next.run(command, ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::debug!(
                correlation_id = ctx.correlation_id(),
                elapsed_ms,
                "命令执行完成"
            ),
            Err(error) => tracing::warn!(
                correlation_id = ctx.correlation_id(),
                code = error.code(),
                elapsed_ms,
                "命令执行失败"
            ),
        }
        result
    }
}
