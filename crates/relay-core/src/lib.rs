#![doc = "relay-core: 类型化命令管道的并发与组合内核。"]
#![doc = ""]
#![doc = "== 定位 =="]
#![doc = "本 Crate 提供一个通用的异步执行基座：类型化命令经由优先级排序的中间件链路抵达终端处理器，"]
#![doc = "沿途由内核统一执行横切契约——准入背压、熔断、隔板、重试、幂等、去重、缓存、事件扇出与审计漏斗。"]
#![doc = ""]
#![doc = "== 并发模型 =="]
#![doc = "内核运行在协作式任务图上（Tokio 调度器）：任务在显式挂起点让出（信号量等待、重试睡眠、幂等轮询、"]
#![doc = "事件投递），单任务内部顺序执行。取消始终是协作式的，任何原语都不会单方面回收在途资源。"]
#![doc = ""]
#![doc = "== 兼容性与版本治理 =="]
#![doc = "本 Crate 遵守语义化版本 2.0 (SemVer)。破坏性变更仅允许在 MAJOR 版本中引入；"]
#![doc = "错误码与事件名是机器可读契约，重命名视同破坏性变更。"]
#![allow(clippy::result_large_err)]

pub use async_trait::async_trait;

pub mod adaptive;
pub mod audit;
pub mod backpressure;
pub mod breaker;
pub mod bulkhead;
pub mod cache;
pub mod chain;
pub mod codec;
pub mod command;
pub mod context;
pub mod contract;
pub mod dedup;
pub mod error;
pub mod events;
pub mod executor;
pub mod idempotency;
pub mod metrics;
pub mod ratelimit;
pub mod retry;
pub mod security;
pub mod trace;

pub use adaptive::{
    AdaptiveConfig, AdaptiveConfigError, AdaptiveController, AdaptiveHandle, AdaptiveSnapshot,
    LATENCY_WINDOW, ResourceSignals, StaticSignals, THROUGHPUT_WINDOW,
};
pub use audit::{
    AuditEvent, AuditFunnel, AuditFunnelConfig, AuditSink, LoggerHealthEvent, TracingAuditSink,
};
pub use backpressure::{
    AdmissionPermit, BackPressureConfig, BackPressureConfigError, BackPressureSemaphore,
    BackPressureSnapshot, OverflowReason, OverflowStrategy, overflow_reason,
};
pub use breaker::{
    BreakerConfig, BreakerConfigError, BreakerStateSnapshot, BreakerTransition, CircuitBreaker,
};
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadConfigError, BulkheadPermit};
pub use cache::{CacheBackend, CacheConfig, CacheCoordinator, CacheOutcome, InMemoryCacheBackend};
pub use chain::{
    ChainStrategy, DEFAULT_MAX_DEPTH, ExecutionPriority, Middleware, MiddlewareChain, Next,
};
pub use codec::ResultCodec;
pub use command::{Command, CommandHandler, CommandMetadata, Interceptor};
pub use context::{CommandContext, ContextKey, ContextSnapshot, ContextStore, StoreGuard};
pub use contract::{Cancellation, Deadline, TimeoutBudget};
pub use dedup::{
    CommandFingerprinter, DedupOutcome, DeduplicationConfig, DeduplicationEngine, DuplicatePolicy,
    SweeperHandle, sha256_hex,
};
pub use error::{ErrorCause, RelayError, codes};
pub use events::{
    EventBus, EventBusConfig, EventBusStats, EventSubscriber, PipelineEvent, kinds,
};
pub use executor::{Dispatcher, Pipeline, PipelineBuilder};
pub use idempotency::{
    ErrorDescriptor, IdempotencyConfig, IdempotencyCoordinator, IdempotencyRecord,
    IdempotencyStatus, IdempotencyStore, InMemoryIdempotencyStore,
};
pub use metrics::{MetricsRing, MetricsTransport, Profiler, StageReport};
pub use ratelimit::{
    RateLimitStatus, RateLimiter, TokenBucketConfig, TokenBucketConfigError, TokenBucketLimiter,
};
pub use retry::{
    DelayStrategy, ErrorClassifier, RetryAllTransient, RetryEngine, RetryPolicy, RetryPolicyError,
};
pub use security::{KeyMaterial, KeyStore};
pub use trace::{
    Span, SpanOutcome, Trace, TraceContext, current_trace_context, with_trace_context,
};
