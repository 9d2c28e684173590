#![doc = "relay-middleware: 命令管道可复用中间件组件集。"]
#![doc = ""]
#![doc = "== 组件与缺省档位 =="]
#![doc = "各组件以 relay-core 的原语为内核，按链路档位从外到内的推荐缺省排布："]
#![doc = "日志 Custom(50) → 限速 Custom(150) → 去重 PreProcessing(300) → 幂等 Custom(350)"]
#![doc = "→ 缓存 PostProcessing(500) → 重试 Custom(700) → 熔断 Custom(800) → 隔板 Custom(900)。"]
#![doc = "重试位于熔断之外，失败的探测不会被重试掩盖；所有档位均可经配置覆盖。"]

pub mod caching;
pub mod dedup;
pub mod idempotency;
pub mod logging;
pub mod ratelimit;
pub mod resilience;

pub use caching::{CacheMiddleware, CacheMiddlewareConfig};
pub use dedup::{DeduplicationMiddleware, DeduplicationMiddlewareConfig};
pub use idempotency::{IdempotencyMiddleware, IdempotencyMiddlewareConfig};
pub use logging::{LoggingMiddleware, LoggingMiddlewareConfig};
pub use ratelimit::{RateLimitMiddleware, RateLimitMiddlewareConfig};
pub use resilience::{
    BulkheadMiddleware, BulkheadMiddlewareConfig, CircuitBreakerMiddleware,
    CircuitBreakerMiddlewareConfig, RetryMiddleware, RetryMiddlewareConfig,
};
