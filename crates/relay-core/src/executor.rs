use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::backpressure::BackPressureSemaphore;
use crate::chain::{DEFAULT_MAX_DEPTH, Middleware, MiddlewareChain};
use crate::command::{Command, CommandHandler, Interceptor};
use crate::context::CommandContext;
use crate::error::{RelayError, codes};
use crate::events::{PipelineEvent, kinds};
use crate::metrics::Profiler;

/// [`Pipeline`] 的装配构建器。
///
/// # 契约说明（What）
/// - 中间件与拦截器按注册顺序收集；链路顺序由优先级稳定排序决定，
///   拦截器顺序即注册顺序；
/// - `build` 在构建期完成深度校验与排序，产出不可变管道。
pub struct PipelineBuilder<C: Command> {
    handler: Arc<dyn CommandHandler<C>>,
    middlewares: Vec<Arc<dyn Middleware<C>>>,
    interceptors: Vec<Arc<dyn Interceptor<C>>>,
    semaphore: Option<BackPressureSemaphore>,
    profiler: Option<Arc<Profiler>>,
    max_depth: usize,
}

impl<C: Command> PipelineBuilder<C> {
    /// 以终端处理器开始装配。
    pub fn new(handler: impl CommandHandler<C>) -> Self {
        Self::from_arc(Arc::new(handler))
    }

    /// 以既有处理器引用开始装配。
    pub fn from_arc(handler: Arc<dyn CommandHandler<C>>) -> Self {
        Self {
            handler,
            middlewares: Vec::new(),
            interceptors: Vec::new(),
            semaphore: None,
            profiler: None,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// 追加中间件。
    pub fn with_middleware(mut self, middleware: impl Middleware<C>) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// 追加既有中间件引用。
    pub fn with_middleware_arc(mut self, middleware: Arc<dyn Middleware<C>>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// 追加拦截器。
    pub fn with_interceptor(mut self, interceptor: impl Interceptor<C>) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// 设置入口背压信号量。
    pub fn with_back_pressure(mut self, semaphore: BackPressureSemaphore) -> Self {
        self.semaphore = Some(semaphore);
        self
    }

    /// 设置耗时剖析器。
    pub fn with_profiler(mut self, profiler: Arc<Profiler>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    /// 覆盖链路深度上限。
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// 完成装配。
    pub fn build(self) -> Result<Pipeline<C>, RelayError> {
        let chain = MiddlewareChain::build(self.middlewares, self.handler, self.max_depth)?;
        Ok(Pipeline {
            chain,
            interceptors: self.interceptors.into(),
            semaphore: self.semaphore,
            profiler: self.profiler,
        })
    }
}

/// 端到端的命令执行器：拦截器 → 准入 → 链路 → 处理器。
///
/// # 逻辑解析（How）
/// 1. 拦截器按注册顺序串行应用，每一步收到上一步返回的命令值；
/// 2. 配置了背压信号量时申请准入令牌，等待期间感知取消与截止；
/// 3. 执行组合链路；取消与截止在每个中间件边界复查；
/// 4. 准入令牌绑定在本次调用的栈帧上（`Drop` 语义），无论成功、失败还是
///    提前返回都恰好释放一次。
///
/// # 契约说明（What）
/// - 执行器自身不打断在途的外部操作；中间件内部的睡眠与等待自行感知
///   取消与截止；
/// - 生命周期事件（开始、完成、失败）经由上下文的事件出口发布。
pub struct Pipeline<C: Command> {
    chain: MiddlewareChain<C>,
    interceptors: Arc<[Arc<dyn Interceptor<C>>]>,
    semaphore: Option<BackPressureSemaphore>,
    profiler: Option<Arc<Profiler>>,
}

impl<C: Command> Clone for Pipeline<C> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            interceptors: Arc::clone(&self.interceptors),
            semaphore: self.semaphore.clone(),
            profiler: self.profiler.clone(),
        }
    }
}

impl<C: Command> Pipeline<C> {
    /// 开始装配一条管道。
    pub fn builder(handler: impl CommandHandler<C>) -> PipelineBuilder<C> {
        PipelineBuilder::new(handler)
    }

    /// 访问组合链路。
    pub fn chain(&self) -> &MiddlewareChain<C> {
        &self.chain
    }

    /// 执行一条命令。
    pub async fn execute(&self, command: C, ctx: &CommandContext) -> Result<C::Result, RelayError> {
        let started = Instant::now();
        ctx.emit(PipelineEvent::new(kinds::PIPELINE_STARTED));

        let result = self.execute_inner(command, ctx).await;

        let elapsed = started.elapsed();
        if let Some(profiler) = &self.profiler {
            profiler.record("pipeline", elapsed);
        }
        match &result {
            Ok(_) => ctx.emit(
                PipelineEvent::new(kinds::PIPELINE_COMPLETED)
                    .with_attribute("elapsed_ms", elapsed.as_millis().to_string()),
            ),
            Err(error) => ctx.emit(
                PipelineEvent::new(kinds::PIPELINE_FAILED).with_attribute("code", error.code()),
            ),
        }
        result
    }

    async fn execute_inner(
        &self,
        mut command: C,
        ctx: &CommandContext,
    ) -> Result<C::Result, RelayError> {
        ctx.ensure_live()?;

        for interceptor in self.interceptors.iter() {
            command = interceptor.intercept(command, ctx)?;
        }

        // 令牌绑定本栈帧：链路无论以何种方式退出都恰好释放一次。
        let _permit = match &self.semaphore {
            Some(semaphore) => Some(
                semaphore
                    .acquire_with(1, ctx.cancellation(), ctx.deadline())
                    .await?,
            ),
            None => None,
        };

        self.chain.execute(command, ctx).await
    }
}

impl<C: Command> std::fmt::Debug for Pipeline<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("chain", &self.chain)
            .field("interceptors", &self.interceptors.len())
            .field("back_pressure", &self.semaphore.is_some())
            .finish()
    }
}

/// 异构命令的管道注册表：命令类型 → 类型擦除后的管道。
///
/// # 设计背景（Why）
/// - 调用方常需要一个“把任意已注册命令丢进来”的入口；类型擦除只发生在
///   注册表边界，链路内部仍是单命令类型的强类型组合。
pub struct Dispatcher {
    pipelines: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Dispatcher {
    /// 创建空注册表。
    pub fn new() -> Self {
        Self {
            pipelines: DashMap::new(),
        }
    }

    /// 注册某一命令类型的管道；同类型重复注册以后者为准。
    pub fn register<C: Command>(&self, pipeline: Pipeline<C>) {
        self.pipelines
            .insert(TypeId::of::<C>(), Arc::new(pipeline));
    }

    /// 便捷注册：以裸处理器构建无中间件管道。
    pub fn register_handler<C: Command>(
        &self,
        handler: impl CommandHandler<C>,
    ) -> Result<(), RelayError> {
        let pipeline = Pipeline::builder(handler).build()?;
        self.register(pipeline);
        Ok(())
    }

    /// 判断命令类型是否已注册。
    pub fn contains<C: Command>(&self) -> bool {
        self.pipelines.contains_key(&TypeId::of::<C>())
    }

    /// 已注册的命令类型数。
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    /// 注册表是否为空。
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// 执行一条已注册类型的命令。
    pub async fn execute<C: Command>(
        &self,
        command: C,
        ctx: &CommandContext,
    ) -> Result<C::Result, RelayError> {
        let erased = {
            let Some(entry) = self.pipelines.get(&TypeId::of::<C>()) else {
                return Err(RelayError::new(
                    codes::EXECUTION_FAILED,
                    format!("命令类型 {} 未注册处理器", std::any::type_name::<C>()),
                ));
            };
            Arc::clone(entry.value())
        };
        let pipeline = erased.downcast::<Pipeline<C>>().map_err(|_| {
            RelayError::new(codes::EXECUTION_FAILED, "注册表条目与命令类型不一致")
        })?;
        pipeline.execute(command, ctx).await
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registered", &self.pipelines.len())
            .finish()
    }
}
