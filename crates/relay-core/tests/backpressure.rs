use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use relay_core::backpressure::{
    BackPressureConfig, BackPressureSemaphore, OverflowReason, OverflowStrategy, overflow_reason,
};
use relay_core::error::codes;

fn semaphore(config: BackPressureConfig) -> BackPressureSemaphore {
    BackPressureSemaphore::new(config).expect("配置合法")
}

/// 验证挂起策略下的 FIFO 恢复顺序与在途上限。
///
/// # 测试目标（Why）
/// - 并发上限 2、在途上限 5 时，七个同时提交的任务应当：前两个立即开始，
///   第 3–5 个按入队顺序在首批释放后开始，第 6–7 个在提交时溢出；
/// - 防止恢复顺序退化为 LIFO 或随机顺序。
///
/// # 测试步骤（How）
/// 1. 依次派生七个任务，每个任务获取令牌后记录开始序号并持有 100ms；
/// 2. 虚拟时钟推进，收集开始顺序与溢出结果。
///
/// # 输入/输出契约（What）
/// - **后置条件**：开始顺序精确等于提交顺序 1..=5；任务 6、7 以
///   `backpressure.overflow`（refused）失败。
#[tokio::test(start_paused = true)]
async fn suspend_strategy_resumes_waiters_in_fifo_order() {
    let semaphore = semaphore(
        BackPressureConfig::new(2, OverflowStrategy::Suspend).with_max_outstanding(5),
    );
    let started = Arc::new(Mutex::new(Vec::new()));
    let rejected = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for index in 1..=7_u32 {
        let semaphore = semaphore.clone();
        let started = Arc::clone(&started);
        let rejected = Arc::clone(&rejected);
        tasks.push(tokio::spawn(async move {
            match semaphore.acquire(1).await {
                Ok(permit) => {
                    started.lock().push(index);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    drop(permit);
                }
                Err(error) => {
                    rejected.lock().push((index, overflow_reason(&error)));
                }
            }
        }));
        // 让任务推进到 acquire，保证提交顺序确定。
        tokio::task::yield_now().await;
    }

    for task in tasks {
        task.await.expect("任务不应崩溃");
    }

    assert_eq!(
        *started.lock(),
        vec![1, 2, 3, 4, 5],
        "开始顺序应等于提交顺序（FIFO）"
    );
    assert_eq!(
        *rejected.lock(),
        vec![
            (6, Some(OverflowReason::Refused)),
            (7, Some(OverflowReason::Refused)),
        ],
        "超出在途上限的提交应立即以 refused 失败"
    );
}

/// 验证边界行为：并发 1、在途 1、丢新策略下第二个到达者立即失败。
#[tokio::test]
async fn drop_newest_rejects_second_arrival_without_queueing() {
    let semaphore = semaphore(
        BackPressureConfig::new(1, OverflowStrategy::DropNewest).with_max_outstanding(1),
    );

    let holder = semaphore.acquire(1).await.expect("首个到达者应放行");
    let error = semaphore.acquire(1).await.expect_err("第二个到达者应失败");
    assert_eq!(error.code(), codes::BACKPRESSURE_OVERFLOW);
    assert_eq!(overflow_reason(&error), Some(OverflowReason::DroppedNewest));
    assert_eq!(semaphore.snapshot().queued, 0, "丢新策略不应排队");
    drop(holder);
}

/// 验证丢旧策略：最老等待者被驱逐并以 dropped_oldest 失败，新来者入队。
#[tokio::test]
async fn drop_oldest_evicts_head_waiter_for_newcomer() {
    let semaphore = semaphore(
        BackPressureConfig::new(1, OverflowStrategy::DropOldest).with_max_outstanding(2),
    );

    let holder = semaphore.acquire(1).await.expect("首个到达者应放行");

    let first_waiter = {
        let semaphore = semaphore.clone();
        tokio::spawn(async move { semaphore.acquire(1).await })
    };
    tokio::task::yield_now().await;
    assert_eq!(semaphore.snapshot().queued, 1);

    let second_waiter = {
        let semaphore = semaphore.clone();
        tokio::spawn(async move { semaphore.acquire(1).await })
    };
    tokio::task::yield_now().await;

    let evicted = first_waiter
        .await
        .expect("任务不应崩溃")
        .expect_err("最老等待者应被驱逐");
    assert_eq!(overflow_reason(&evicted), Some(OverflowReason::DroppedOldest));

    drop(holder);
    let permit = second_waiter
        .await
        .expect("任务不应崩溃")
        .expect("新来者应接棒获得令牌");
    drop(permit);
    assert_eq!(semaphore.snapshot().active, 0);
}

/// 验证拒绝策略从不排队：无空位即刻 refused。
#[tokio::test]
async fn refuse_strategy_never_queues() {
    let semaphore = semaphore(BackPressureConfig::new(1, OverflowStrategy::Refuse));

    let holder = semaphore.acquire(1).await.expect("首个到达者应放行");
    let error = semaphore.acquire(1).await.expect_err("无空位应立即失败");
    assert_eq!(overflow_reason(&error), Some(OverflowReason::Refused));
    assert_eq!(semaphore.snapshot().queued, 0);
    drop(holder);

    semaphore
        .acquire(1)
        .await
        .expect("释放后的下一次申请应放行");
}

/// 验证：放弃排队的等待者不消耗槽位，后续等待者照常接棒。
///
/// # 测试步骤（How）
/// 1. 持有者占满唯一槽位，两名等待者先后入队；
/// 2. 中止第一名等待者（其接收端随任务销毁）；
/// 3. 释放持有者：授予路径跳过死信槽，第二名等待者获得令牌。
#[tokio::test]
async fn abandoned_waiter_does_not_leak_slot() {
    let semaphore = semaphore(BackPressureConfig::new(1, OverflowStrategy::Suspend));

    let holder = semaphore.acquire(1).await.expect("首个到达者应放行");

    let doomed = {
        let semaphore = semaphore.clone();
        tokio::spawn(async move { semaphore.acquire(1).await })
    };
    tokio::task::yield_now().await;

    let survivor = {
        let semaphore = semaphore.clone();
        tokio::spawn(async move { semaphore.acquire(1).await })
    };
    tokio::task::yield_now().await;
    assert_eq!(semaphore.snapshot().queued, 2);

    doomed.abort();
    let _ = doomed.await;

    drop(holder);
    let permit = survivor
        .await
        .expect("任务不应崩溃")
        .expect("幸存等待者应获得令牌");

    let snapshot = semaphore.snapshot();
    assert_eq!(snapshot.active, 1, "只有幸存者持有令牌");
    drop(permit);
    assert_eq!(semaphore.snapshot().active, 0, "令牌应恰好释放一次");
}

/// 验证：上调并发上限只影响后续放行，并立即补发排队等待者。
#[tokio::test]
async fn resize_grants_queued_waiters_without_revoking_tokens() {
    let semaphore = semaphore(BackPressureConfig::new(1, OverflowStrategy::Suspend));

    let holder = semaphore.acquire(1).await.expect("首个到达者应放行");
    let waiter = {
        let semaphore = semaphore.clone();
        tokio::spawn(async move { semaphore.acquire(1).await })
    };
    tokio::task::yield_now().await;
    assert_eq!(semaphore.snapshot().queued, 1);

    semaphore.resize(2).expect("上调应成功");
    let permit = waiter
        .await
        .expect("任务不应崩溃")
        .expect("扩容后等待者应立即获批");

    let snapshot = semaphore.snapshot();
    assert_eq!(snapshot.active, 2, "在途令牌不被回收，新旧令牌并存");
    assert_eq!(snapshot.max_concurrency, 2);
    drop(holder);
    drop(permit);
}

/// 验证：队列代价账面超限时按策略处置（挂起策略下 refused）。
#[tokio::test]
async fn queue_byte_accounting_limits_admission() {
    let semaphore = semaphore(
        BackPressureConfig::new(1, OverflowStrategy::Suspend).with_max_queue_bytes(10),
    );

    let holder = semaphore.acquire(1).await.expect("首个到达者应放行");

    let waiter = {
        let semaphore = semaphore.clone();
        tokio::spawn(async move { semaphore.acquire(8).await })
    };
    tokio::task::yield_now().await;
    assert_eq!(semaphore.snapshot().queued_bytes, 8);

    let error = semaphore
        .acquire(5)
        .await
        .expect_err("账面超限的申请应失败");
    assert_eq!(overflow_reason(&error), Some(OverflowReason::Refused));

    drop(holder);
    waiter
        .await
        .expect("任务不应崩溃")
        .expect("账面内的等待者应获批");
}
