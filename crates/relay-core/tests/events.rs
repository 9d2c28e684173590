use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use relay_core::error::{RelayError, codes};
use relay_core::events::{EventBus, EventSubscriber, PipelineEvent};

struct RecordingSubscriber {
    received: Mutex<Vec<(u64, String)>>,
}

impl RecordingSubscriber {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            received: Mutex::new(Vec::new()),
        })
    }

    fn kinds(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .map(|(_, kind)| kind.clone())
            .collect()
    }

    fn sequences(&self) -> Vec<u64> {
        self.received.lock().iter().map(|(seq, _)| *seq).collect()
    }
}

#[async_trait]
impl EventSubscriber for RecordingSubscriber {
    async fn on_event(&self, event: PipelineEvent) -> Result<(), RelayError> {
        self.received
            .lock()
            .push((event.sequence(), event.kind().to_string()));
        Ok(())
    }

    fn subscriber_name(&self) -> &str {
        "recording"
    }
}

struct FailingSubscriber;

#[async_trait]
impl EventSubscriber for FailingSubscriber {
    async fn on_event(&self, _event: PipelineEvent) -> Result<(), RelayError> {
        Err(RelayError::new(codes::EXECUTION_FAILED, "订阅者故障"))
    }

    fn subscriber_name(&self) -> &str {
        "failing"
    }
}

/// 等待总线把既有事件全部派发完毕。
async fn drain(bus: &EventBus, expected: u64) {
    for _ in 0..1_000 {
        let stats = bus.stats();
        if stats.delivered + stats.failed >= expected {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("事件未在预期轮次内投递完成");
}

/// 验证：单个订阅者观察到的顺序与发布顺序一致，序号单调递增。
///
/// # 测试目标（Why）
/// - 发布是同步入队、投递异步进行；订阅者视角的顺序保证是总线的核心契约，
///   不得因任务调度交错而乱序。
#[tokio::test]
async fn per_subscriber_delivery_preserves_emission_order() {
    let bus = EventBus::new();
    let subscriber = RecordingSubscriber::new();
    bus.subscribe(&subscriber);

    for index in 0..10 {
        bus.emit(PipelineEvent::new(format!("step.{index}")).with_correlation_id("corr-1"));
    }
    drain(&bus, 10).await;

    let expected: Vec<String> = (0..10).map(|i| format!("step.{i}")).collect();
    assert_eq!(subscriber.kinds(), expected, "订阅者应按发布顺序观察事件");

    let sequences = subscriber.sequences();
    assert!(
        sequences.windows(2).all(|w| w[0] < w[1]),
        "序号应随发布顺序单调递增"
    );
}

/// 验证：弱引用订阅不延长订阅者生命周期，清扫移除死亡条目。
#[tokio::test]
async fn dead_subscribers_are_reaped() {
    let bus = EventBus::new();
    let subscriber = RecordingSubscriber::new();
    bus.subscribe(&subscriber);
    assert_eq!(bus.subscriber_count(), 1);

    drop(subscriber);
    assert_eq!(bus.subscriber_count(), 0, "存活计数应立即反映外部释放");

    let removed = bus.reap_now();
    assert_eq!(removed, 1, "清扫应移除死亡条目");
    assert_eq!(bus.stats().reaped, 1);

    // 清扫后发布不应崩溃。
    bus.emit(PipelineEvent::new("after.reap"));
}

/// 验证：订阅者处理失败只计入统计，不重试、不影响其他订阅者。
#[tokio::test]
async fn subscriber_failure_is_counted_not_retried() {
    let bus = EventBus::new();
    let failing = Arc::new(FailingSubscriber);
    let healthy = RecordingSubscriber::new();
    bus.subscribe(&failing);
    bus.subscribe(&healthy);

    bus.emit(PipelineEvent::new("probe"));
    drain(&bus, 2).await;

    let stats = bus.stats();
    assert_eq!(stats.failed, 1, "故障订阅者计入失败");
    assert_eq!(stats.delivered, 1, "健康订阅者正常收到");
    assert_eq!(healthy.kinds(), vec!["probe".to_string()]);
}

/// 验证：注销后不再投递。
#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let bus = EventBus::new();
    let subscriber = RecordingSubscriber::new();
    bus.subscribe(&subscriber);

    bus.emit(PipelineEvent::new("first"));
    drain(&bus, 1).await;

    bus.unsubscribe(&subscriber);
    bus.emit(PipelineEvent::new("second"));
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    assert_eq!(
        subscriber.kinds(),
        vec!["first".to_string()],
        "注销后的事件不应抵达"
    );
}
