use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;

use relay_core::chain::{ExecutionPriority, Middleware, Next};
use relay_core::codec::ResultCodec;
use relay_core::command::Command;
use relay_core::context::CommandContext;
use relay_core::error::RelayError;
use relay_core::idempotency::{IdempotencyCoordinator, IdempotencyStore};

/// 幂等中间件配置。
#[derive(Clone, Debug)]
pub struct IdempotencyMiddlewareConfig {
    /// 组件稳定名称。
    pub name: Cow<'static, str>,
    /// 链路档位；缺省紧随去重之后。
    pub priority: ExecutionPriority,
}

impl Default for IdempotencyMiddlewareConfig {
    fn default() -> Self {
        Self {
            name: Cow::Borrowed("relay.middleware.idempotency"),
            priority: ExecutionPriority::Custom(350),
        }
    }
}

/// 键控至多一次执行中间件。
///
/// # 契约说明（What）
/// - 幂等键由注入的生成器从命令计算；下游链路作为被包裹操作交给
///   [`IdempotencyCoordinator`]，TTL 内的重复键直接返回既有结果（缓存
///   命中时继续函数不被调用，属正常短路）；
/// - 等待在途对端期间感知上下文的取消信号。
pub struct IdempotencyMiddleware<C: Command, S> {
    coordinator: Arc<IdempotencyCoordinator<S>>,
    key_generator: Arc<dyn Fn(&C) -> String + Send + Sync>,
    codec: ResultCodec<C::Result>,
    config: IdempotencyMiddlewareConfig,
}

impl<C: Command, S> IdempotencyMiddleware<C, S> {
    /// 以协调器、键生成器与结果编解码器构造组件。
    pub fn new(
        coordinator: Arc<IdempotencyCoordinator<S>>,
        key_generator: impl Fn(&C) -> String + Send + Sync + 'static,
        codec: ResultCodec<C::Result>,
    ) -> Self {
        Self {
            coordinator,
            key_generator: Arc::new(key_generator),
            codec,
            config: IdempotencyMiddlewareConfig::default(),
        }
    }

    /// 覆盖配置。
    pub fn with_config(mut self, config: IdempotencyMiddlewareConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl<C, S> Middleware<C> for IdempotencyMiddleware<C, S>
where
    C: Command,
    S: IdempotencyStore,
{
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
        let key = (self.key_generator)(&command);
        self.coordinator
            .execute(&key, &self.codec, ctx.cancellation(), || {
                next.run(command, ctx)
            })
            .await
    }
}

impl<C: Command, S> std::fmt::Debug for IdempotencyMiddleware<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyMiddleware")
            .field("name", &self.config.name)
            .finish_non_exhaustive()
    }
}
