use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use relay_core::command::{Command, CommandHandler, CommandMetadata};
use relay_core::context::CommandContext;
use relay_core::dedup::{
    DeduplicationConfig, DeduplicationEngine, DuplicatePolicy, sha256_hex,
};
use relay_core::error::{RelayError, codes};
use relay_core::executor::Pipeline;
use relay_middleware::dedup::DeduplicationMiddleware;

#[derive(Clone, Debug)]
struct NoteCommand {
    text: String,
}

impl Command for NoteCommand {
    type Result = String;
}

struct NoteHandler {
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl CommandHandler<NoteCommand> for NoteHandler {
    async fn handle(&self, command: NoteCommand, _ctx: &CommandContext) -> Result<String, RelayError> {
        let count = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{}#{}", command.text, count))
    }
}

fn pipeline(policy: DuplicatePolicy, invocations: &Arc<AtomicUsize>) -> Pipeline<NoteCommand> {
    let engine = Arc::new(DeduplicationEngine::new(DeduplicationConfig {
        window: Duration::from_secs(60),
        policy,
    }));
    Pipeline::builder(NoteHandler {
        invocations: Arc::clone(invocations),
    })
    .with_middleware(DeduplicationMiddleware::new(
        engine,
        |command: &NoteCommand| sha256_hex(command.text.as_bytes()),
    ))
    .build()
    .expect("链路构建应成功")
}

fn command() -> NoteCommand {
    NoteCommand {
        text: "note".to_string(),
    }
}

/// 验证拒绝策略下的双重提交：恰好一次内部执行，第二次以重复错误失败。
#[tokio::test]
async fn reject_policy_blocks_second_submission() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let pipeline = pipeline(DuplicatePolicy::Reject, &invocations);

    let ctx = CommandContext::new(CommandMetadata::new());
    let first = pipeline.execute(command(), &ctx).await.expect("首次应成功");
    assert_eq!(first, "note#1");

    let ctx = CommandContext::new(CommandMetadata::new());
    let error = pipeline
        .execute(command(), &ctx)
        .await
        .expect_err("窗口内重复应被拒绝");
    assert_eq!(error.code(), codes::DUPLICATE_COMMAND);
    assert_eq!(invocations.load(Ordering::SeqCst), 1, "处理器只应执行一次");
}

/// 验证回放策略下的双重提交：恰好一次内部执行，两次调用结果相等。
#[tokio::test]
async fn return_cached_policy_replays_first_result() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let pipeline = pipeline(DuplicatePolicy::ReturnCached, &invocations);

    let ctx = CommandContext::new(CommandMetadata::new());
    let first = pipeline.execute(command(), &ctx).await.expect("首次应成功");

    let ctx = CommandContext::new(CommandMetadata::new());
    let second = pipeline.execute(command(), &ctx).await.expect("重复应回放结果");

    assert_eq!(first, second, "两次调用应收到相等结果");
    assert_eq!(invocations.load(Ordering::SeqCst), 1, "处理器只应执行一次");
}

/// 验证打标放行策略：重复命令照常执行，但上下文带上重复标记。
#[tokio::test]
async fn mark_and_proceed_flags_duplicate_context() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let pipeline = pipeline(DuplicatePolicy::MarkAndProceed, &invocations);

    let first_ctx = CommandContext::new(CommandMetadata::new());
    pipeline
        .execute(command(), &first_ctx)
        .await
        .expect("首次应成功");
    assert!(!first_ctx.is_duplicate(), "新颖命令不应带重复标记");

    let second_ctx = CommandContext::new(CommandMetadata::new());
    pipeline
        .execute(command(), &second_ctx)
        .await
        .expect("重复命令照常放行");
    assert!(second_ctx.is_duplicate(), "重复命令应带上重复标记");
    assert_eq!(invocations.load(Ordering::SeqCst), 2, "两次都应执行");
}

/// 验证：不同内容的命令拥有不同指纹，互不干扰。
#[tokio::test]
async fn distinct_payloads_do_not_collide() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let pipeline = pipeline(DuplicatePolicy::Reject, &invocations);

    let ctx = CommandContext::new(CommandMetadata::new());
    pipeline
        .execute(
            NoteCommand {
                text: "alpha".to_string(),
            },
            &ctx,
        )
        .await
        .expect("alpha 应成功");

    let ctx = CommandContext::new(CommandMetadata::new());
    pipeline
        .execute(
            NoteCommand {
                text: "beta".to_string(),
            },
            &ctx,
        )
        .await
        .expect("beta 不应被 alpha 的窗口拦截");
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}
