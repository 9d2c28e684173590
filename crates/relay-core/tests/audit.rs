use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use relay_core::audit::{
    AuditEvent, AuditFunnel, AuditFunnelConfig, AuditSink, LoggerHealthEvent,
};
use relay_core::error::{RelayError, codes};
use relay_core::trace::{TraceContext, with_trace_context};

struct RecordingSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }
}

impl AuditSink for RecordingSink {
    fn log(&self, event: &AuditEvent) -> Result<(), RelayError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// 首次失败、此后成功的落地端。
struct FlakySink {
    failed_once: AtomicBool,
}

impl AuditSink for FlakySink {
    fn log(&self, _event: &AuditEvent) -> Result<(), RelayError> {
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            return Err(RelayError::new(codes::EXECUTION_FAILED, "落地端暂不可用"));
        }
        Ok(())
    }
}

async fn drain<T>(sink: &Mutex<Vec<T>>, expected: usize) {
    for _ in 0..1_000 {
        if sink.lock().len() >= expected {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("审计事件未在预期轮次内落地");
}

/// 验证：提交路径从任务本地追踪上下文充实事件，消费任务按序落地。
#[tokio::test]
async fn events_are_enriched_from_task_local_trace() {
    let sink = RecordingSink::new();
    let funnel = AuditFunnel::new(
        Arc::clone(&sink) as Arc<dyn AuditSink>,
        AuditFunnelConfig::default(),
    );

    let trace = TraceContext::generate();
    with_trace_context(trace.clone(), async {
        funnel.log(AuditEvent::new("user.login").with_user_id("u-1"));
    })
    .await;
    funnel.log(AuditEvent::new("user.logout"));

    drain(&sink.events, 2).await;
    let events = sink.events.lock();
    assert_eq!(events[0].event_type, "user.login");
    assert_eq!(
        events[0].trace_id.as_deref(),
        Some(trace.trace_id()),
        "作用域内的事件应带上链路标识"
    );
    assert_eq!(events[0].user_id.as_deref(), Some("u-1"));
    assert_eq!(
        events[1].trace_id, None,
        "作用域外的事件不应伪造链路标识"
    );
}

/// 验证：队列占满时非阻塞丢弃，健康通道依次给出积压与丢弃信号。
///
/// # 测试步骤（How）
/// 1. 容量 1 的漏斗；在消费任务获得调度之前连续提交两条事件；
/// 2. 第一条入队后深度越过水位线，第二条触发丢弃；
/// 3. 健康订阅依次观察 `Backpressure` 与 `Dropped`。
#[tokio::test]
async fn full_queue_drops_without_blocking() {
    let sink = RecordingSink::new();
    let funnel = AuditFunnel::new(
        Arc::clone(&sink) as Arc<dyn AuditSink>,
        AuditFunnelConfig {
            capacity: 1,
            backpressure_ratio: 0.8,
        },
    );
    let mut health = funnel.health();

    funnel.log(AuditEvent::new("first"));
    funnel.log(AuditEvent::new("second"));

    assert_eq!(funnel.dropped_total(), 1, "超出容量的事件应被丢弃");

    match health.recv().await.expect("应收到健康信号") {
        LoggerHealthEvent::Backpressure { queue_depth } => assert_eq!(queue_depth, 1),
        other => panic!("第一条信号应为积压，得到 {other:?}"),
    }
    match health.recv().await.expect("应收到健康信号") {
        LoggerHealthEvent::Dropped { count, reason } => {
            assert_eq!(count, 1);
            assert_eq!(reason, "queue_full");
        }
        other => panic!("第二条信号应为丢弃，得到 {other:?}"),
    }

    drain(&sink.events, 1).await;
    assert_eq!(sink.events.lock()[0].event_type, "first", "先入队者照常落地");
}

/// 验证：落地端失败与恢复通过健康通道对外报告，事件不重试。
#[tokio::test]
async fn sink_failure_and_recovery_are_reported() {
    let funnel = AuditFunnel::new(
        Arc::new(FlakySink {
            failed_once: AtomicBool::new(false),
        }),
        AuditFunnelConfig::default(),
    );
    let mut health = funnel.health();

    funnel.log(AuditEvent::new("doomed"));
    funnel.log(AuditEvent::new("lucky"));

    match health.recv().await.expect("应收到健康信号") {
        LoggerHealthEvent::SinkFailure { code } => assert_eq!(code, codes::EXECUTION_FAILED),
        other => panic!("第一条信号应为落地失败，得到 {other:?}"),
    }
    match health.recv().await.expect("应收到健康信号") {
        LoggerHealthEvent::Recovered => {}
        other => panic!("第二条信号应为恢复，得到 {other:?}"),
    }
}
