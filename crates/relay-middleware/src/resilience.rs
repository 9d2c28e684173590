use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;

use relay_core::breaker::{BreakerStateSnapshot, BreakerTransition, CircuitBreaker};
use relay_core::bulkhead::Bulkhead;
use relay_core::chain::{ExecutionPriority, Middleware, Next};
use relay_core::command::Command;
use relay_core::context::CommandContext;
use relay_core::error::{RelayError, codes};
use relay_core::events::{PipelineEvent, kinds};
use relay_core::retry::RetryEngine;

/// 重试中间件配置。
#[derive(Clone, Debug)]
pub struct RetryMiddlewareConfig {
    /// 组件稳定名称。
    pub name: Cow<'static, str>,
    /// 链路档位；缺省位于熔断之外。
    pub priority: ExecutionPriority,
}

impl Default for RetryMiddlewareConfig {
    fn default() -> Self {
        Self {
            name: Cow::Borrowed("relay.middleware.retry"),
            priority: ExecutionPriority::Custom(700),
        }
    }
}

/// 以 [`RetryEngine`] 重放下游链路的中间件。
///
/// # 契约说明（What）
/// - 需要重放继续函数，因此声明 `unsafe_next` 放开单次调用约束；
/// - 命令按值重放，要求 `C: Clone`；重放产生的副作用由业务自行裁决，
///   需要至多一次语义时与幂等中间件组合；
/// - 第二次及以后的尝试经由上下文发布 `retry.attempted` 事件。
pub struct RetryMiddleware {
    engine: RetryEngine,
    config: RetryMiddlewareConfig,
}

impl RetryMiddleware {
    /// 以引擎与缺省配置构造组件。
    pub fn new(engine: RetryEngine) -> Self {
        Self {
            engine,
            config: RetryMiddlewareConfig::default(),
        }
    }

    /// 覆盖配置。
    pub fn with_config(mut self, config: RetryMiddlewareConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl<C> Middleware<C> for RetryMiddleware
where
    C: Command + Clone,
{
    fn priority(&self) -> ExecutionPriority {
        self.config.priority
    }

    fn name(&self) -> Cow<'static, str> {
        self.config.name.clone()
    }

    fn unsafe_next(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        command: C,
        ctx: &CommandContext,
        next: Next<'_, C>,
    ) -> Result<C::Result, RelayError> {
        let next = &next;
        self.engine
            .execute(ctx.cancellation(), ctx.deadline(), |attempt| {
                let command = command.clone();
                async move {
                    if attempt > 1 {
                        ctx.emit(
                            PipelineEvent::new(kinds::RETRY_ATTEMPTED)
                                .with_attribute("attempt", attempt.to_string()),
                        );
                    }
                    next.run(command, ctx).await
                }
            })
            .await
    }
}

impl std::fmt::Debug for RetryMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryMiddleware")
            .field("policy", self.engine.policy())
            .finish()
    }
}

/// 熔断中间件配置。
#[derive(Clone, Debug)]
pub struct CircuitBreakerMiddlewareConfig {
    /// 组件稳定名称。
    pub name: Cow<'static, str>,
    /// 链路档位；缺省位于重试之内、隔板之外。
    pub priority: ExecutionPriority,
}

impl Default for CircuitBreakerMiddlewareConfig {
    fn default() -> Self {
        Self {
            name: Cow::Borrowed("relay.middleware.breaker"),
            priority: ExecutionPriority::Custom(800),
        }
    }
}

/// 以 [`CircuitBreaker`] 隔离持续失败下游的中间件。
///
/// # 契约说明（What）
/// - 熔断拒绝属正常短路，组件静默缺失调用诊断；
/// - 失败回执在上抛**之前**记入熔断器；取消类错误不计入（非下游故障），
///   截止超时计入（慢下游同样应触发隔离）；
/// - 状态迁移（打开、恢复、半开探测）经由上下文发布事件。
pub struct CircuitBreakerMiddleware {
    breaker: Arc<CircuitBreaker>,
    config: CircuitBreakerMiddlewareConfig,
}

impl CircuitBreakerMiddleware {
    /// 以熔断器与缺省配置构造组件。
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            breaker,
            config: CircuitBreakerMiddlewareConfig::default(),
        }
    }

    /// 覆盖配置。
    pub fn with_config(mut self, config: CircuitBreakerMiddlewareConfig) -> Self {
        self.config = config;
        self
    }

    fn emit_transition(&self, ctx: &CommandContext, transition: BreakerTransition) {
        let kind = match transition {
            BreakerTransition::Opened => kinds::BREAKER_OPENED,
            BreakerTransition::Closed => kinds::BREAKER_CLOSED,
            BreakerTransition::HalfOpened => kinds::BREAKER_HALF_OPEN,
            _ => unreachable!("BreakerTransition 出现未知变体"),
        };
        ctx.emit(PipelineEvent::new(kind).with_attribute("breaker", self.breaker.name().to_string()));
    }
}

#[async_trait]
impl<C: Command> Middleware<C> for CircuitBreakerMiddleware {
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
        if !self.breaker.allow() {
            return Err(RelayError::new(
                codes::BREAKER_OPEN,
                format!("熔断器 {} 处于打开状态", self.breaker.name()),
            ));
        }
        if matches!(self.breaker.state(), BreakerStateSnapshot::HalfOpen) {
            ctx.emit(
                PipelineEvent::new(kinds::BREAKER_HALF_OPEN)
                    .with_attribute("breaker", self.breaker.name().to_string()),
            );
        }

        let result = next.run(command, ctx).await;
        match &result {
            Ok(_) => {
                if let Some(transition) = self.breaker.record_success() {
                    self.emit_transition(ctx, transition);
                }
            }
            Err(error) if error.is_cancellation() => {}
            Err(_) => {
                if let Some(transition) = self.breaker.record_failure() {
                    self.emit_transition(ctx, transition);
                }
            }
        }
        result
    }
}

impl std::fmt::Debug for CircuitBreakerMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerMiddleware")
            .field("breaker", &self.breaker.name())
            .finish()
    }
}

/// 隔板中间件配置。
#[derive(Clone, Debug)]
pub struct BulkheadMiddlewareConfig {
    /// 组件稳定名称。
    pub name: Cow<'static, str>,
    /// 链路档位；缺省位于最内层。
    pub priority: ExecutionPriority,
}

impl Default for BulkheadMiddlewareConfig {
    fn default() -> Self {
        Self {
            name: Cow::Borrowed("relay.middleware.bulkhead"),
            priority: ExecutionPriority::Custom(900),
        }
    }
}

/// 以 [`Bulkhead`] 为下游划定独立并发池的中间件。
pub struct BulkheadMiddleware {
    bulkhead: Bulkhead,
    config: BulkheadMiddlewareConfig,
}

impl BulkheadMiddleware {
    /// 以隔板与缺省配置构造组件。
    pub fn new(bulkhead: Bulkhead) -> Self {
        Self {
            bulkhead,
            config: BulkheadMiddlewareConfig::default(),
        }
    }

    /// 覆盖配置。
    pub fn with_config(mut self, config: BulkheadMiddlewareConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl<C: Command> Middleware<C> for BulkheadMiddleware {
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
        let _permit = self
            .bulkhead
            .acquire_with(ctx.cancellation(), ctx.deadline())
            .await?;
        next.run(command, ctx).await
    }
}

impl std::fmt::Debug for BulkheadMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkheadMiddleware")
            .field("bulkhead", &self.bulkhead.name())
            .finish()
    }
}
