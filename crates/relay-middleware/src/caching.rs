use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;

use relay_core::cache::{CacheBackend, CacheCoordinator, CacheOutcome};
use relay_core::chain::{ExecutionPriority, Middleware, Next};
use relay_core::codec::ResultCodec;
use relay_core::command::Command;
use relay_core::context::CommandContext;
use relay_core::error::RelayError;
use relay_core::events::{PipelineEvent, kinds};

/// 缓存中间件配置。
#[derive(Clone, Debug)]
pub struct CacheMiddlewareConfig {
    /// 组件稳定名称。
    pub name: Cow<'static, str>,
    /// 链路档位；缺省贴近处理器。
    pub priority: ExecutionPriority,
}

impl Default for CacheMiddlewareConfig {
    fn default() -> Self {
        Self {
            name: Cow::Borrowed("relay.middleware.cache"),
            priority: ExecutionPriority::PostProcessing,
        }
    }
}

/// 键控结果备忘中间件。
///
/// # 逻辑解析（How）
/// - 键由注入的生成器从命令计算；`should_cache` 判否时整体旁路；
/// - 取值与回源交给 [`CacheCoordinator`]（含单飞与软性解码恢复），组件
///   负责把结论翻译为 `cache.hit` / `cache.miss` / `cache.stored` 事件；
/// - 命中短路属正常路径，组件静默缺失调用诊断。
pub struct CacheMiddleware<C: Command, B> {
    coordinator: Arc<CacheCoordinator<B>>,
    key_generator: Arc<dyn Fn(&C) -> String + Send + Sync>,
    should_cache: Arc<dyn Fn(&C) -> bool + Send + Sync>,
    codec: ResultCodec<C::Result>,
    config: CacheMiddlewareConfig,
}

impl<C: Command, B> CacheMiddleware<C, B> {
    /// 以协调器、键生成器与结果编解码器构造组件；缺省缓存所有命令。
    pub fn new(
        coordinator: Arc<CacheCoordinator<B>>,
        key_generator: impl Fn(&C) -> String + Send + Sync + 'static,
        codec: ResultCodec<C::Result>,
    ) -> Self {
        Self {
            coordinator,
            key_generator: Arc::new(key_generator),
            should_cache: Arc::new(|_| true),
            codec,
            config: CacheMiddlewareConfig::default(),
        }
    }

    /// 注入旁路判定。
    pub fn with_should_cache(
        mut self,
        should_cache: impl Fn(&C) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_cache = Arc::new(should_cache);
        self
    }

    /// 覆盖配置。
    pub fn with_config(mut self, config: CacheMiddlewareConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl<C, B> Middleware<C> for CacheMiddleware<C, B>
where
    C: Command,
    B: CacheBackend,
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
        if !(self.should_cache)(&command) {
            return next.run(command, ctx).await;
        }

        let key = (self.key_generator)(&command);
        let (value, outcome) = self
            .coordinator
            .get_or_compute(&key, &self.codec, || next.run(command, ctx))
            .await?;

        match outcome {
            CacheOutcome::Hit => {
                ctx.emit(PipelineEvent::new(kinds::CACHE_HIT).with_attribute("key", key));
            }
            CacheOutcome::Miss { stored } => {
                ctx.emit(PipelineEvent::new(kinds::CACHE_MISS).with_attribute("key", key.clone()));
                if stored {
                    ctx.emit(PipelineEvent::new(kinds::CACHE_STORED).with_attribute("key", key));
                }
            }
            _ => unreachable!("CacheOutcome 出现未知变体"),
        }
        Ok(value)
    }
}

impl<C: Command, B> std::fmt::Debug for CacheMiddleware<C, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMiddleware")
            .field("name", &self.config.name)
            .finish_non_exhaustive()
    }
}
