use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::command::{Command, CommandHandler};
use crate::context::CommandContext;
use crate::error::{RelayError, codes};
use crate::events::{PipelineEvent, kinds};

/// 链路执行优先级；数值越小越先执行。
///
/// # 契约说明（What）
/// - 预置档位对应固定数值：鉴权 100、校验 200、前置 300、处理 400、
///   后置 500、容错 600；`Custom` 自由取值，缺省 1000。
/// - 排序、相等与散列均以数值为准：`Custom(200)` 与 `Validation` 同档。
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub enum ExecutionPriority {
    /// 鉴权（100）。
    Authentication,
    /// 校验（200）。
    Validation,
    /// 前置处理（300）。
    PreProcessing,
    /// 处理（400）。
    Processing,
    /// 后置处理（500）。
    PostProcessing,
    /// 容错处理（600）。
    ErrorHandling,
    /// 自定义档位。
    Custom(i32),
}

impl ExecutionPriority {
    /// 档位数值。
    pub const fn value(self) -> i32 {
        match self {
            ExecutionPriority::Authentication => 100,
            ExecutionPriority::Validation => 200,
            ExecutionPriority::PreProcessing => 300,
            ExecutionPriority::Processing => 400,
            ExecutionPriority::PostProcessing => 500,
            ExecutionPriority::ErrorHandling => 600,
            ExecutionPriority::Custom(value) => value,
        }
    }

    /// 自定义档位的缺省值（1000）。
    pub const fn custom_default() -> Self {
        ExecutionPriority::Custom(1000)
    }
}

impl PartialEq for ExecutionPriority {
    fn eq(&self, other: &Self) -> bool {
        self.value() == other.value()
    }
}

impl Eq for ExecutionPriority {}

impl PartialOrd for ExecutionPriority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExecutionPriority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value().cmp(&other.value())
    }
}

impl std::hash::Hash for ExecutionPriority {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.value().hash(state);
    }
}

impl Default for ExecutionPriority {
    fn default() -> Self {
        Self::custom_default()
    }
}

/// 中间件契约：包裹继续函数的拦截阶段。
///
/// # 设计背景（Why）
/// - 单方法加优先级读数的扁平接口足以表达链路组合，避免深继承层次；
///   可选能力（放开单次调用约束、静默短路诊断）以缺省为否的提供方法表达，
///   实现按需覆写。
///
/// # 契约说明（What）
/// - `execute` 收到命令、上下文与继续函数 [`Next`]；调用 `next.run` 进入
///   下一阶段，或不调用而短路（返回缓存值、拒绝等）。
/// - 除非覆写 `unsafe_next` 为真，继续函数至多调用一次；第二次调用以
///   [`codes::NEXT_CALLED_TWICE`] 失败。
/// - 正常短路的中间件应覆写 `suppress_missing_next_warning` 静默诊断。
///
/// # 风险提示（Trade-offs）
/// - 不得在持有任何用户锁时调用 `next`：链路自身从不跨阶段持锁，调用方
///   破坏该纪律可能与下游组件互锁。
#[async_trait]
pub trait Middleware<C: Command>: Send + Sync + 'static {
    /// 链路档位；缺省 `Custom(1000)`。
    fn priority(&self) -> ExecutionPriority {
        ExecutionPriority::custom_default()
    }

    /// 稳定名称，用于诊断与事件标签。
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("anonymous.middleware")
    }

    /// 执行拦截逻辑。
    async fn execute(
        &self,
        command: C,
        ctx: &CommandContext,
        next: Next<'_, C>,
    ) -> Result<C::Result, RelayError>;

    /// 放开“继续函数至多调用一次”的约束（如重试中间件需要重放下游）。
    fn unsafe_next(&self) -> bool {
        false
    }

    /// 静默“返回前未调用继续函数”的诊断（如缓存命中短路属正常路径）。
    fn suppress_missing_next_warning(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GuardState {
    Pending,
    Called,
    Released,
}

struct GuardCell {
    state: Mutex<GuardState>,
    middleware: Cow<'static, str>,
    unsafe_next: bool,
    suppress_missing_warning: bool,
}

/// 继续函数：指向链路中当前阶段的下一跳。
///
/// # 逻辑解析（How）
/// - 内部携带本次调用的单调状态守卫（`pending → called → released`）：
///   严格模式下第二次调用以 [`codes::NEXT_CALLED_TWICE`] 失败、释放后调用
///   以 [`codes::NEXT_AFTER_RELEASE`] 失败；声明 `unsafe_next` 的中间件
///   跳过该约束。
/// - 中间件返回后由链路释放守卫：从未调用且未静默、且调用未被取消时，
///   输出一条缺失调用诊断（不构成失败，短路是合法行为）。
pub struct Next<'a, C: Command> {
    stages: &'a [Arc<dyn Middleware<C>>],
    handler: &'a dyn CommandHandler<C>,
    index: usize,
    guard: Arc<GuardCell>,
}

impl<C: Command> Next<'_, C> {
    /// 进入链路的下一阶段。
    pub async fn run(&self, command: C, ctx: &CommandContext) -> Result<C::Result, RelayError> {
        if self.guard.unsafe_next {
            let mut state = self.guard.state.lock();
            if *state == GuardState::Pending {
                *state = GuardState::Called;
            }
        } else {
            let mut state = self.guard.state.lock();
            match *state {
                GuardState::Pending => *state = GuardState::Called,
                GuardState::Called => {
                    return Err(RelayError::new(
                        codes::NEXT_CALLED_TWICE,
                        format!("中间件 {} 第二次调用继续函数", self.guard.middleware),
                    ));
                }
                GuardState::Released => {
                    return Err(RelayError::new(
                        codes::NEXT_AFTER_RELEASE,
                        format!("中间件 {} 在守卫释放后调用继续函数", self.guard.middleware),
                    ));
                }
            }
        }
        dispatch(self.stages, self.handler, self.index, command, ctx).await
    }
}

impl<C: Command> std::fmt::Debug for Next<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("middleware", &self.guard.middleware)
            .finish()
    }
}

// 链路以对象安全的 BoxFuture 递推：中间件经由继续函数重入 dispatch，
// 装箱切断了递推的类型环。
fn dispatch<'a, C: Command>(
    stages: &'a [Arc<dyn Middleware<C>>],
    handler: &'a dyn CommandHandler<C>,
    index: usize,
    command: C,
    ctx: &'a CommandContext,
) -> BoxFuture<'a, Result<C::Result, RelayError>> {
    async move {
        // 取消与截止在每个阶段边界检查一次；阶段内部的等待自行感知。
        ctx.ensure_live()?;

        let Some(stage) = stages.get(index) else {
            return handler.handle(command, ctx).await;
        };

        ctx.emit(
            PipelineEvent::new(kinds::MIDDLEWARE_ENTERED)
                .with_attribute("middleware", stage.name().to_string()),
        );

        let guard = Arc::new(GuardCell {
            state: Mutex::new(GuardState::Pending),
            middleware: stage.name(),
            unsafe_next: stage.unsafe_next(),
            suppress_missing_warning: stage.suppress_missing_next_warning(),
        });
        let next = Next {
            stages,
            handler,
            index: index + 1,
            guard: Arc::clone(&guard),
        };

        let result = stage.execute(command, ctx, next).await;

        {
            let mut state = guard.state.lock();
            if *state == GuardState::Pending
                && !guard.suppress_missing_warning
                && !guard.unsafe_next
                && !ctx.cancellation().is_cancelled()
            {
                tracing::warn!(
                    middleware = %guard.middleware,
                    "中间件返回前未调用继续函数；若短路属正常路径，请实现 suppress_missing_next_warning"
                );
            }
            *state = GuardState::Released;
        }

        result
    }
    .boxed()
}

/// 构建期分析出的执行形态。
///
/// # 契约说明（What）
/// - `Sequential` 是强制兜底：任何无法静态证明安全的形态都回落到顺序执行；
/// - `FailFast` 描述“存在领头的校验档位阶段”：排序后的顺序遍历天然满足其
///   外显契约——校验阶段先于其余阶段进入，校验失败即跳过剩余链路。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChainStrategy {
    /// 顺序执行。
    Sequential,
    /// 校验先行：前缀为校验档位的阶段数。
    FailFast {
        /// 处于校验档位的前缀阶段数。
        validators: usize,
    },
}

/// 链路深度的缺省上限。
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// 优先级排序的中间件组合，终止于处理器。
///
/// # 逻辑解析（How）
/// - 构建时按优先级数值升序做**稳定**排序：同档位保持注册顺序；
/// - 组合语义等价于把中间件自右向左折叠到处理器之上：终端继续函数即
///   `handler.handle`，每一跳以守卫包装后交给上一层中间件；
/// - 运行时以索引推进代替闭包嵌套，每跳构造一次守卫与 [`Next`]。
///
/// # 契约说明（What）
/// - 构建期超过 `max_depth` 以 [`codes::CHAIN_DEPTH_EXCEEDED`] 失败；
/// - 链路一经构建即不可变。
pub struct MiddlewareChain<C: Command> {
    stages: Arc<[Arc<dyn Middleware<C>>]>,
    handler: Arc<dyn CommandHandler<C>>,
    strategy: ChainStrategy,
}

impl<C: Command> Clone for MiddlewareChain<C> {
    fn clone(&self) -> Self {
        Self {
            stages: Arc::clone(&self.stages),
            handler: Arc::clone(&self.handler),
            strategy: self.strategy,
        }
    }
}

impl<C: Command> MiddlewareChain<C> {
    /// 以中间件集合与处理器构建链路。
    pub fn build(
        mut middlewares: Vec<Arc<dyn Middleware<C>>>,
        handler: Arc<dyn CommandHandler<C>>,
        max_depth: usize,
    ) -> Result<Self, RelayError> {
        if middlewares.len() > max_depth {
            return Err(RelayError::new(
                codes::CHAIN_DEPTH_EXCEEDED,
                format!("链路长度 {} 超过上限 {max_depth}", middlewares.len()),
            ));
        }
        // Vec::sort_by_key 是稳定排序，同档位保持注册顺序。
        middlewares.sort_by_key(|stage| stage.priority().value());
        let strategy = analyze(&middlewares);
        Ok(Self {
            stages: middlewares.into(),
            handler,
            strategy,
        })
    }

    /// 构建期分析出的执行形态。
    pub fn strategy(&self) -> ChainStrategy {
        self.strategy
    }

    /// 链路中的阶段数。
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// 链路是否没有中间件。
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// 按链路顺序列出阶段名。
    pub fn stage_names(&self) -> Vec<Cow<'static, str>> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// 执行整条链路。
    pub async fn execute(&self, command: C, ctx: &CommandContext) -> Result<C::Result, RelayError> {
        dispatch(&self.stages, self.handler.as_ref(), 0, command, ctx).await
    }
}

impl<C: Command> std::fmt::Debug for MiddlewareChain<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("stages", &self.stage_names())
            .field("strategy", &self.strategy)
            .finish()
    }
}

fn analyze<C: Command>(stages: &[Arc<dyn Middleware<C>>]) -> ChainStrategy {
    let validators = stages
        .iter()
        .take_while(|stage| stage.priority().value() <= ExecutionPriority::Validation.value())
        .filter(|stage| stage.priority() == ExecutionPriority::Validation)
        .count();
    if validators > 0 {
        ChainStrategy::FailFast { validators }
    } else {
        ChainStrategy::Sequential
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 验证：优先级比较、相等与排序都以数值为准。
    #[test]
    fn priority_ordering_follows_value() {
        assert!(ExecutionPriority::Authentication < ExecutionPriority::Validation);
        assert!(ExecutionPriority::Custom(50) < ExecutionPriority::Authentication);
        assert_eq!(
            ExecutionPriority::Custom(200),
            ExecutionPriority::Validation
        );
        assert_eq!(ExecutionPriority::custom_default().value(), 1000);
    }

    /// 验证：稳定排序在同档位上保持插入顺序。
    #[test]
    fn stable_sort_keeps_insertion_order_for_ties() {
        let mut values = vec![
            ("b", ExecutionPriority::Processing),
            ("a", ExecutionPriority::Validation),
            ("c", ExecutionPriority::Processing),
        ];
        values.sort_by_key(|(_, p)| p.value());
        let names: Vec<&str> = values.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
