use std::time::Duration;

use relay_core::command::CommandMetadata;
use relay_core::context::{CommandContext, ContextKey};
use relay_core::contract::Deadline;
use relay_core::error::codes;

struct TenantId;
impl ContextKey for TenantId {
    type Value = String;
}

struct AttemptCount;
impl ContextKey for AttemptCount {
    type Value = u32;
}

/// 验证：分叉出的上下文与父上下文互不影响，固定单元照常拷贝。
///
/// # 测试目标（Why）
/// - 分叉用于并行子工作；若分叉后的写入回渗父方，链路间会出现幽灵状态。
#[tokio::test]
async fn fork_isolates_typed_store_mutations() {
    let ctx = CommandContext::new(CommandMetadata::new().with_correlation_id("corr-7"));
    ctx.store().set::<TenantId>(Some("acme".to_string()));
    ctx.record_metric("latency_ms", 12.0);
    ctx.mark_duplicate();

    let fork = ctx.fork();
    assert_eq!(fork.correlation_id(), ctx.correlation_id());
    assert_eq!(
        fork.store().get::<TenantId>().as_deref(),
        Some(&"acme".to_string()),
        "分叉应预置父方条目"
    );
    assert!(fork.is_duplicate(), "重复标记按值拷贝");

    fork.store().set::<TenantId>(Some("globex".to_string()));
    fork.store().set::<AttemptCount>(Some(3));
    fork.record_metric("latency_ms", 99.0);

    assert_eq!(
        ctx.store().get::<TenantId>().as_deref(),
        Some(&"acme".to_string()),
        "分叉上的替换不得回渗父方"
    );
    assert!(ctx.store().get::<AttemptCount>().is_none());
    assert_eq!(ctx.metric("latency_ms"), Some(12.0));
    assert_eq!(fork.metric("latency_ms"), Some(99.0));
}

/// 验证：clear 清空类型化存储与指标、注记，元数据派生单元不动。
#[tokio::test]
async fn clear_keeps_metadata_derived_cells() {
    let metadata = CommandMetadata::new()
        .with_user_id("u-1")
        .with_correlation_id("corr-9");
    let ctx = CommandContext::new(metadata.clone());
    ctx.store().set::<TenantId>(Some("acme".to_string()));
    ctx.record_metric("m", 1.0);
    ctx.set_annotation("k", "v");

    ctx.clear();

    assert!(ctx.store().is_empty(), "类型化存储应被清空");
    assert_eq!(ctx.metric("m"), None);
    assert_eq!(ctx.annotation("k"), None);
    assert_eq!(ctx.request_id(), metadata.id(), "请求标识保持不变");
    assert_eq!(ctx.correlation_id(), "corr-9");
    assert_eq!(ctx.user_id(), Some("u-1"));
}

/// 验证：存活检查的因果顺序——取消优先于截止。
#[tokio::test(start_paused = true)]
async fn liveness_check_prefers_cancellation_over_deadline() {
    let ctx = CommandContext::new(CommandMetadata::new())
        .with_deadline(Deadline::after(Duration::from_millis(10)));

    assert!(ctx.ensure_live().is_ok());

    tokio::time::sleep(Duration::from_millis(20)).await;
    let deadline_error = ctx.ensure_live().expect_err("超过截止点应失败");
    assert_eq!(deadline_error.code(), codes::DEADLINE_EXCEEDED);

    ctx.cancellation().cancel();
    let cancel_error = ctx.ensure_live().expect_err("取消后应失败");
    assert_eq!(
        cancel_error.code(),
        codes::CANCELLED,
        "两者同时成立时取消是因果方"
    );
}

/// 验证：相关性标识缺省时自动生成，存在时原样沿用。
#[tokio::test]
async fn correlation_id_defaults_when_metadata_omits_it() {
    let explicit = CommandContext::new(CommandMetadata::new().with_correlation_id("corr-x"));
    assert_eq!(explicit.correlation_id(), "corr-x");

    let generated = CommandContext::new(CommandMetadata::new());
    assert!(
        !generated.correlation_id().is_empty(),
        "缺省相关性标识应自动生成"
    );
}

/// 验证：未附接事件总线时发布为空操作，不影响执行。
#[tokio::test]
async fn emit_without_bus_is_noop() {
    let ctx = CommandContext::new(CommandMetadata::new());
    ctx.emit(relay_core::events::PipelineEvent::new("orphan"));
    assert!(ctx.ensure_live().is_ok());
}
