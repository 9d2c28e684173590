use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;

use relay_core::chain::{ExecutionPriority, Middleware, Next};
use relay_core::command::Command;
use relay_core::context::CommandContext;
use relay_core::dedup::{CommandFingerprinter, DedupOutcome, DeduplicationEngine};
use relay_core::error::{RelayError, codes};
use relay_core::events::{PipelineEvent, kinds};

/// 去重中间件配置。
#[derive(Clone, Debug)]
pub struct DeduplicationMiddlewareConfig {
    /// 组件稳定名称。
    pub name: Cow<'static, str>,
    /// 链路档位；缺省位于前置处理档。
    pub priority: ExecutionPriority,
}

impl Default for DeduplicationMiddlewareConfig {
    fn default() -> Self {
        Self {
            name: Cow::Borrowed("relay.middleware.dedup"),
            priority: ExecutionPriority::PreProcessing,
        }
    }
}

/// 指纹去重中间件。
///
/// # 契约说明（What）
/// - 新颖命令照常执行，完成后以指纹登记结果并开启重复窗口；
/// - 窗口内重复按引擎策略处置：拒绝（[`codes::DUPLICATE_COMMAND`]）、
///   返回留存结果、或打上重复标记后放行；打标放行的重复不刷新窗口；
/// - 留存结果类型不兼容时告警并按新颖命令执行，宁可重算不可错付。
pub struct DeduplicationMiddleware<C: Command> {
    engine: Arc<DeduplicationEngine>,
    fingerprinter: Arc<dyn CommandFingerprinter<C>>,
    config: DeduplicationMiddlewareConfig,
}

impl<C: Command> DeduplicationMiddleware<C> {
    /// 以引擎与指纹器构造组件。
    pub fn new(
        engine: Arc<DeduplicationEngine>,
        fingerprinter: impl CommandFingerprinter<C>,
    ) -> Self {
        Self {
            engine,
            fingerprinter: Arc::new(fingerprinter),
            config: DeduplicationMiddlewareConfig::default(),
        }
    }

    /// 覆盖配置。
    pub fn with_config(mut self, config: DeduplicationMiddlewareConfig) -> Self {
        self.config = config;
        self
    }

    fn emit_duplicate(&self, ctx: &CommandContext, fingerprint: &str, action: &'static str) {
        ctx.emit(
            PipelineEvent::new(kinds::DEDUP_DUPLICATE)
                .with_attribute("fingerprint", fingerprint.to_string())
                .with_attribute("action", action),
        );
    }
}

#[async_trait]
impl<C> Middleware<C> for DeduplicationMiddleware<C>
where
    C: Command,
    C::Result: Clone + Send + Sync,
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
        let fingerprint = self.fingerprinter.fingerprint(&command);

        match self.engine.evaluate(&fingerprint) {
            DedupOutcome::Rejected => {
                self.emit_duplicate(ctx, &fingerprint, "reject");
                Err(RelayError::new(
                    codes::DUPLICATE_COMMAND,
                    format!("指纹 {fingerprint} 在窗口内重复"),
                ))
            }
            DedupOutcome::Cached(stored) => match stored.downcast::<C::Result>() {
                Ok(result) => {
                    self.emit_duplicate(ctx, &fingerprint, "return_cached");
                    Ok((*result).clone())
                }
                Err(_) => {
                    tracing::warn!(fingerprint = %fingerprint, "去重留存结果类型不兼容，按新颖命令重新执行");
                    let result = next.run(command, ctx).await?;
                    self.engine
                        .record_completion(fingerprint, Arc::new(result.clone()));
                    Ok(result)
                }
            },
            DedupOutcome::ProceedMarked => {
                ctx.mark_duplicate();
                self.emit_duplicate(ctx, &fingerprint, "mark_and_proceed");
                next.run(command, ctx).await
            }
            DedupOutcome::Proceed => {
                let result = next.run(command, ctx).await?;
                self.engine
                    .record_completion(fingerprint, Arc::new(result.clone()));
                Ok(result)
            }
            _ => unreachable!("DedupOutcome 出现未知变体"),
        }
    }
}

impl<C: Command> std::fmt::Debug for DeduplicationMiddleware<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeduplicationMiddleware")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
