use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::backpressure::BackPressureSemaphore;
use crate::metrics::MetricsRing;

/// 延迟样本环容量。
pub const LATENCY_WINDOW: usize = 100;
/// 吞吐样本环容量。
pub const THROUGHPUT_WINDOW: usize = 20;

/// 运行时资源信号源。
///
/// # 契约说明（What）
/// - 两个读数均归一化到 `[0, 1]`；实现应快速返回，控制环路按固定周期采样。
pub trait ResourceSignals: Send + Sync + 'static {
    /// CPU 利用率。
    fn cpu_utilization(&self) -> f64;

    /// 内存压力。
    fn memory_pressure(&self) -> f64;
}

/// 可编程的静态信号源，供测试与未接入真实探测器的部署使用。
#[derive(Debug, Default)]
pub struct StaticSignals {
    cpu_bits: AtomicU64,
    memory_bits: AtomicU64,
}

impl StaticSignals {
    /// 以初始读数构造信号源。
    pub fn new(cpu: f64, memory: f64) -> Self {
        Self {
            cpu_bits: AtomicU64::new(cpu.to_bits()),
            memory_bits: AtomicU64::new(memory.to_bits()),
        }
    }

    /// 更新 CPU 读数。
    pub fn set_cpu(&self, cpu: f64) {
        self.cpu_bits.store(cpu.to_bits(), Ordering::Relaxed);
    }

    /// 更新内存压力读数。
    pub fn set_memory_pressure(&self, memory: f64) {
        self.memory_bits.store(memory.to_bits(), Ordering::Relaxed);
    }
}

impl ResourceSignals for StaticSignals {
    fn cpu_utilization(&self) -> f64 {
        f64::from_bits(self.cpu_bits.load(Ordering::Relaxed))
    }

    fn memory_pressure(&self) -> f64 {
        f64::from_bits(self.memory_bits.load(Ordering::Relaxed))
    }
}

/// 自适应控制器配置。
#[derive(Clone, Copy, Debug)]
pub struct AdaptiveConfig {
    /// 并发上限的下界。
    pub min: usize,
    /// 并发上限的上界。
    pub max: usize,
    /// CPU 利用率目标。
    pub target_cpu: f64,
    /// 内存压力上限目标。
    pub target_memory_pressure: f64,
    /// 调整周期。
    pub adjust_interval: Duration,
    /// 调整力度，取值 `[0, 1]`。
    pub aggressiveness: f64,
}

impl AdaptiveConfig {
    /// 校验配置合法性。
    pub fn validate(&self) -> Result<(), AdaptiveConfigError> {
        if self.min == 0 {
            return Err(AdaptiveConfigError::ZeroMin);
        }
        if self.max < self.min {
            return Err(AdaptiveConfigError::MaxBelowMin);
        }
        if !(0.0..=1.0).contains(&self.aggressiveness) {
            return Err(AdaptiveConfigError::AggressivenessOutOfRange);
        }
        if self.adjust_interval.is_zero() {
            return Err(AdaptiveConfigError::ZeroInterval);
        }
        Ok(())
    }
}

/// 自适应控制器配置校验错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum AdaptiveConfigError {
    #[error("min 必须大于 0")]
    ZeroMin,
    #[error("max 不得小于 min")]
    MaxBelowMin,
    #[error("aggressiveness 必须位于 [0, 1]")]
    AggressivenessOutOfRange,
    #[error("adjust_interval 必须严格为正")]
    ZeroInterval,
}

/// 控制器的观测快照。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdaptiveSnapshot {
    /// 最近一次应用后的并发上限。
    pub current_limit: usize,
    /// 延迟窗口样本数。
    pub latency_samples: usize,
    /// 延迟中位数（毫秒）。
    pub latency_p50_ms: f64,
    /// 延迟 99 分位（毫秒）。
    pub latency_p99_ms: f64,
    /// 吞吐窗口样本数（仅供观测，不参与决策）。
    pub throughput_samples: usize,
}

struct ControllerInner {
    config: AdaptiveConfig,
    signals: Arc<dyn ResourceSignals>,
    latencies: Mutex<MetricsRing>,
    throughput: Mutex<MetricsRing>,
    current_limit: AtomicUsize,
}

/// 并发上限的周期性自适应控制器。
///
/// # 设计背景（Why）
/// - 固定的并发上限要么在低载时浪费容量，要么在资源吃紧时放大故障；
///   控制器按周期读取延迟分布与资源信号，小步乘性调整准入上限。
///
/// # 逻辑解析（How）
/// - 每个调整周期（单任务环路）计算一个落在 `[-1, +1]` 的调整量：
///   CPU 低于目标带宽下沿加 0.1、高于上沿减 0.1；内存压力超标减 0.2；
///   延迟 p99/p50 比值超过 10 减 0.15。
/// - 调整量乘以力度系数后按乘法作用于当前上限，再夹紧到 `[min, max]`；
///   上调或下调在取整后至少移动一步，避免小上限时停滞。
/// - 新上限经 [`BackPressureSemaphore::resize`] 下发：只影响后续放行，
///   在途令牌不会被回收。
/// - 吞吐样本环只写不读，作为观测性数据暴露在快照中。
pub struct AdaptiveController {
    inner: Arc<ControllerInner>,
}

impl AdaptiveController {
    /// 以合法配置与信号源构造控制器。
    pub fn new(
        config: AdaptiveConfig,
        signals: Arc<dyn ResourceSignals>,
    ) -> Result<Self, AdaptiveConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                signals,
                latencies: Mutex::new(MetricsRing::new(LATENCY_WINDOW)),
                throughput: Mutex::new(MetricsRing::new(THROUGHPUT_WINDOW)),
                current_limit: AtomicUsize::new(config.min),
            }),
        })
    }

    /// 记录一次完成延迟。
    pub fn record_latency(&self, latency: Duration) {
        self.inner
            .latencies
            .lock()
            .append(latency.as_secs_f64() * 1_000.0);
    }

    /// 记录一次吞吐采样（仅观测用途）。
    pub fn record_throughput(&self, ops_per_second: f64) {
        self.inner.throughput.lock().append(ops_per_second);
    }

    /// 计算当前周期的原始调整量，取值 `[-1, +1]`。
    pub fn compute_adjustment(&self) -> f64 {
        let config = &self.inner.config;
        let mut adjustment = 0.0_f64;

        let cpu = self.inner.signals.cpu_utilization();
        if cpu < config.target_cpu - 0.1 {
            adjustment += 0.1;
        } else if cpu > config.target_cpu + 0.1 {
            adjustment -= 0.1;
        }

        if self.inner.signals.memory_pressure() > config.target_memory_pressure {
            adjustment -= 0.2;
        }

        {
            let latencies = self.inner.latencies.lock();
            if let (Some(p50), Some(p99)) = (latencies.percentile(0.50), latencies.percentile(0.99))
            {
                if p50 > 0.0 && p99 / p50 > 10.0 {
                    adjustment -= 0.15;
                }
            }
        }

        adjustment.clamp(-1.0, 1.0)
    }

    /// 执行一次调整并下发到信号量；返回应用后的上限。
    pub fn apply_once(&self, semaphore: &BackPressureSemaphore) -> usize {
        let config = &self.inner.config;
        let adjustment = self.compute_adjustment() * config.aggressiveness;
        let current = semaphore.max_concurrency();

        let mut next = (current as f64 * (1.0 + adjustment)).round() as usize;
        // 小上限下乘法调整可能取整回原值，至少移动一步。
        if adjustment > 0.0 && next <= current {
            next = current + 1;
        } else if adjustment < 0.0 && next >= current {
            next = current.saturating_sub(1);
        }
        let next = next.clamp(config.min, config.max);

        if next != current {
            // resize 只在 next == 0 时报错，而 clamp 已保证 next >= min >= 1。
            let _ = semaphore.resize(next);
        }
        self.inner.current_limit.store(next, Ordering::Relaxed);
        next
    }

    /// 启动周期调整任务；返回的句柄在丢弃时停止环路。
    pub fn spawn(&self, semaphore: BackPressureSemaphore) -> AdaptiveHandle {
        let inner = Arc::clone(&self.inner);
        let controller = AdaptiveController { inner };
        let interval = self.inner.config.adjust_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 首个 tick 立即完成，跳过以避免启动瞬间的空窗调整。
            ticker.tick().await;
            loop {
                ticker.tick().await;
                controller.apply_once(&semaphore);
            }
        });
        AdaptiveHandle { handle }
    }

    /// 读取观测快照。
    pub fn snapshot(&self) -> AdaptiveSnapshot {
        let latencies = self.inner.latencies.lock();
        AdaptiveSnapshot {
            current_limit: self.inner.current_limit.load(Ordering::Relaxed),
            latency_samples: latencies.count(),
            latency_p50_ms: latencies.percentile(0.50).unwrap_or(0.0),
            latency_p99_ms: latencies.percentile(0.99).unwrap_or(0.0),
            throughput_samples: self.inner.throughput.lock().count(),
        }
    }
}

impl std::fmt::Debug for AdaptiveController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveController")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// 周期调整任务句柄；丢弃即停止。
#[derive(Debug)]
pub struct AdaptiveHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for AdaptiveHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
