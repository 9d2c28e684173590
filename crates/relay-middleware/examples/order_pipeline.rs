//! 端到端装配示例：限流、重试、熔断与缓存围绕一个订单处理器协同工作。
//!
//! 运行方式：`cargo run -p relay-middleware --example order_pipeline`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use relay_core::backpressure::{BackPressureConfig, BackPressureSemaphore, OverflowStrategy};
use relay_core::breaker::{BreakerConfig, CircuitBreaker};
use relay_core::cache::{CacheConfig, CacheCoordinator, InMemoryCacheBackend};
use relay_core::codec::ResultCodec;
use relay_core::command::{Command, CommandHandler, CommandMetadata};
use relay_core::context::CommandContext;
use relay_core::error::RelayError;
use relay_core::events::EventBus;
use relay_core::executor::Pipeline;
use relay_core::retry::{DelayStrategy, RetryEngine, RetryPolicy};
use relay_middleware::caching::CacheMiddleware;
use relay_middleware::logging::LoggingMiddleware;
use relay_middleware::resilience::{CircuitBreakerMiddleware, RetryMiddleware};

#[derive(Clone, Debug)]
struct CreateOrder {
    sku: String,
    quantity: u32,
}

impl Command for CreateOrder {
    type Result = u64;
}

struct OrderHandler;

#[async_trait]
impl CommandHandler<CreateOrder> for OrderHandler {
    async fn handle(&self, command: CreateOrder, ctx: &CommandContext) -> Result<u64, RelayError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.record_metric("order.quantity", command.quantity as f64);
        Ok(u64::from(command.quantity) * 2)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let semaphore = BackPressureSemaphore::new(
        BackPressureConfig::new(8, OverflowStrategy::Suspend).with_max_outstanding(32),
    )?;
    let breaker = Arc::new(CircuitBreaker::new(
        "order-db",
        BreakerConfig {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(5),
            closed_reset_timeout: Duration::from_secs(60),
        },
    )?);
    let cache = Arc::new(CacheCoordinator::new(
        Arc::new(InMemoryCacheBackend::new()),
        CacheConfig {
            ttl: Duration::from_secs(300),
            single_flight: true,
        },
    ));

    let pipeline = Pipeline::builder(OrderHandler)
        .with_middleware(LoggingMiddleware::default())
        .with_middleware(RetryMiddleware::new(RetryEngine::new(
            RetryPolicy::new(3)?.with_strategy(DelayStrategy::JitteredExponential {
                base: Duration::from_millis(50),
                factor: 2.0,
                cap: Duration::from_secs(1),
            }),
        )))
        .with_middleware(CircuitBreakerMiddleware::new(breaker))
        .with_middleware(CacheMiddleware::new(
            cache,
            |command: &CreateOrder| format!("order:{}:{}", command.sku, command.quantity),
            ResultCodec::json(),
        ))
        .with_back_pressure(semaphore)
        .build()?;

    let bus = EventBus::new();
    let command = CreateOrder {
        sku: "sku-42".to_string(),
        quantity: 3,
    };

    let ctx = CommandContext::new(CommandMetadata::new().with_user_id("demo")).with_events(bus.clone());
    let total = pipeline.execute(command.clone(), &ctx).await?;
    println!("首次执行（回源）：total = {total}");

    let ctx = CommandContext::new(CommandMetadata::new().with_user_id("demo")).with_events(bus.clone());
    let cached = pipeline.execute(command, &ctx).await?;
    println!("再次执行（命中）：total = {cached}");

    Ok(())
}
