use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use relay_core::breaker::{BreakerConfig, CircuitBreaker};
use relay_core::bulkhead::{Bulkhead, BulkheadConfig};
use relay_core::command::{Command, CommandHandler, CommandMetadata};
use relay_core::context::CommandContext;
use relay_core::error::{RelayError, codes};
use relay_core::executor::Pipeline;
use relay_core::ratelimit::{TokenBucketConfig, TokenBucketLimiter};
use relay_core::retry::{RetryEngine, RetryPolicy};
use relay_middleware::ratelimit::RateLimitMiddleware;
use relay_middleware::resilience::{
    BulkheadMiddleware, CircuitBreakerMiddleware, RetryMiddleware,
};

#[derive(Clone, Debug)]
struct JobCommand;

impl Command for JobCommand {
    type Result = u32;
}

/// 前若干次失败、之后成功的处理器。
struct FlakyHandler {
    failures_remaining: AtomicU32,
    invocations: Arc<AtomicUsize>,
    delay: Duration,
}

#[async_trait]
impl CommandHandler<JobCommand> for FlakyHandler {
    async fn handle(&self, _command: JobCommand, _ctx: &CommandContext) -> Result<u32, RelayError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(RelayError::new(codes::EXECUTION_FAILED, "下游瞬态失败"));
        }
        Ok(7)
    }
}

fn flaky(failures: u32, invocations: &Arc<AtomicUsize>, delay: Duration) -> FlakyHandler {
    FlakyHandler {
        failures_remaining: AtomicU32::new(failures),
        invocations: Arc::clone(invocations),
        delay,
    }
}

fn context() -> CommandContext {
    CommandContext::new(CommandMetadata::new())
}

/// 验证：重试中间件重放下游链路并掩盖瞬态失败。
///
/// # 测试目标（Why）
/// - 重试组件声明 `unsafe_next`，重放继续函数不得触发单次调用违例；
/// - 一次瞬态失败后第二次尝试成功，调用方只看到成功结果。
#[tokio::test]
async fn retry_middleware_masks_transient_failure() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let pipeline = Pipeline::builder(flaky(1, &invocations, Duration::ZERO))
        .with_middleware(RetryMiddleware::new(RetryEngine::new(
            RetryPolicy::new(3).expect("策略合法"),
        )))
        .build()
        .expect("链路构建应成功");

    let ctx = context();
    let value = pipeline.execute(JobCommand, &ctx).await.expect("重试应掩盖瞬态失败");
    assert_eq!(value, 7);
    assert_eq!(invocations.load(Ordering::SeqCst), 2, "应恰好尝试两次");
}

/// 验证：重试耗尽后以 retry.exhausted 上抛，原因链保留底层失败。
#[tokio::test]
async fn retry_middleware_surfaces_exhaustion() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let pipeline = Pipeline::builder(flaky(10, &invocations, Duration::ZERO))
        .with_middleware(RetryMiddleware::new(RetryEngine::new(
            RetryPolicy::new(3).expect("策略合法"),
        )))
        .build()
        .expect("链路构建应成功");

    let ctx = context();
    let error = pipeline
        .execute(JobCommand, &ctx)
        .await
        .expect_err("持续失败应耗尽重试");
    assert_eq!(error.code(), codes::RETRY_EXHAUSTED);
    assert!(error.cause().is_some(), "底层失败应保留在错误链中");
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
}

/// 验证：熔断中间件在上抛之前记录失败，阈值一到即短路后续请求。
#[tokio::test]
async fn breaker_middleware_opens_after_threshold() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let breaker = Arc::new(
        CircuitBreaker::new(
            "downstream",
            BreakerConfig {
                failure_threshold: 2,
                success_threshold: 1,
                open_timeout: Duration::from_secs(60),
                closed_reset_timeout: Duration::from_secs(60),
            },
        )
        .expect("配置合法"),
    );
    let pipeline = Pipeline::builder(flaky(10, &invocations, Duration::ZERO))
        .with_middleware(CircuitBreakerMiddleware::new(Arc::clone(&breaker)))
        .build()
        .expect("链路构建应成功");

    for _ in 0..2 {
        let ctx = context();
        let error = pipeline
            .execute(JobCommand, &ctx)
            .await
            .expect_err("下游应失败");
        assert_eq!(error.code(), codes::EXECUTION_FAILED);
    }

    let ctx = context();
    let error = pipeline
        .execute(JobCommand, &ctx)
        .await
        .expect_err("熔断打开后应短路");
    assert_eq!(error.code(), codes::BREAKER_OPEN);
    assert_eq!(
        invocations.load(Ordering::SeqCst),
        2,
        "打开状态下处理器不得被触达"
    );
}

/// 验证：隔板中间件限定并发，等待者超界立即 bulkhead.full。
#[tokio::test(start_paused = true)]
async fn bulkhead_middleware_bounds_concurrency() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let bulkhead = Bulkhead::new(
        "jobs",
        BulkheadConfig {
            max_concurrency: 1,
            max_waiting: 0,
        },
    )
    .expect("配置合法");
    let pipeline = Pipeline::builder(flaky(0, &invocations, Duration::from_millis(100)))
        .with_middleware(BulkheadMiddleware::new(bulkhead))
        .build()
        .expect("链路构建应成功");

    let slow = {
        let pipeline = pipeline.clone();
        let ctx = context();
        tokio::spawn(async move { pipeline.execute(JobCommand, &ctx).await })
    };
    tokio::task::yield_now().await;

    let ctx = context();
    let error = pipeline
        .execute(JobCommand, &ctx)
        .await
        .expect_err("槽位占满且不允许等待时应失败");
    assert_eq!(error.code(), codes::BULKHEAD_FULL);

    slow.await
        .expect("任务不应崩溃")
        .expect("占位执行应正常完成");
}

/// 验证：限速中间件按标识扣减额度，超限以 rate_limit.exceeded 拒绝。
#[tokio::test]
async fn ratelimit_middleware_rejects_exhausted_identifier() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let limiter = Arc::new(
        TokenBucketLimiter::new(TokenBucketConfig {
            capacity: 2,
            refill_per_second: 0.001,
        })
        .expect("配置合法"),
    );
    let pipeline = Pipeline::builder(flaky(0, &invocations, Duration::ZERO))
        .with_middleware(RateLimitMiddleware::new(
            limiter as Arc<_>,
            |_command: &JobCommand, ctx: &CommandContext| {
                ctx.user_id().unwrap_or("anonymous").to_string()
            },
        ))
        .build()
        .expect("链路构建应成功");

    for _ in 0..2 {
        let ctx = context();
        pipeline.execute(JobCommand, &ctx).await.expect("额度内应放行");
    }

    let ctx = context();
    let error = pipeline
        .execute(JobCommand, &ctx)
        .await
        .expect_err("额度耗尽应拒绝");
    assert_eq!(error.code(), codes::RATE_LIMIT_EXCEEDED);
    assert_eq!(invocations.load(Ordering::SeqCst), 2, "被拒调用不得触达处理器");
}
