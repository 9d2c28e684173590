use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::RelayError;

/// 指标外发通道契约（仅协议，具体线缆格式由实现决定）。
///
/// # 契约说明（What）
/// - `send` / `send_batch` 以不透明字节外发，调用方自行约定编码；
/// - 实现不得在调用线程上长时间阻塞，失败以错误返回、不重试；
/// - `close` 幂等，关闭后的发送行为由实现定义（建议快速失败）。
pub trait MetricsTransport: Send + Sync + 'static {
    /// 外发一条指标负载。
    fn send(&self, payload: &[u8]) -> Result<(), RelayError>;

    /// 批量外发指标负载。
    fn send_batch(&self, payloads: &[Vec<u8>]) -> Result<(), RelayError>;

    /// 关闭通道。
    fn close(&self);
}

/// 有界滑动窗口的数值样本环。
///
/// # 契约说明（What）
/// - 容量固定，写满后追加新样本会淘汰最老样本；
/// - `percentile(p)` 对当前窗口升序排序后在相邻样本间线性插值，`p` 取值
///   `[0, 1]`，越界自动夹紧；
/// - 元素级线程安全留给持有者（通常由所有者的互斥锁包裹整个环）。
#[derive(Clone, Debug)]
pub struct MetricsRing {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl MetricsRing {
    /// 以容量构造样本环；容量下限为 1。
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// 追加样本，窗口满时淘汰最老样本。
    pub fn append(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// 当前窗口内的样本数。
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    /// 窗口是否为空。
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// 环容量。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 窗口均值；空窗口返回 `None`。
    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: f64 = self.samples.iter().sum();
        Some(sum / self.samples.len() as f64)
    }

    /// 线性插值分位数；空窗口返回 `None`。
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let p = p.clamp(0.0, 1.0);
        let rank = p * (sorted.len() - 1) as f64;
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        if lower == upper {
            return Some(sorted[lower]);
        }
        let weight = rank - lower as f64;
        Some(sorted[lower] * (1.0 - weight) + sorted[upper] * weight)
    }

    /// 过滤出满足谓词的样本副本。
    pub fn filter(&self, predicate: impl Fn(f64) -> bool) -> Vec<f64> {
        self.samples
            .iter()
            .copied()
            .filter(|sample| predicate(*sample))
            .collect()
    }

    /// 拷贝当前窗口全部样本。
    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().copied().collect()
    }
}

/// 单个具名阶段的统计报告。
#[derive(Clone, Debug, PartialEq)]
pub struct StageReport {
    /// 阶段名。
    pub stage: String,
    /// 窗口内样本数。
    pub count: usize,
    /// 平均耗时（毫秒）。
    pub average_ms: f64,
    /// 中位耗时（毫秒）。
    pub p50_ms: f64,
    /// 95 分位耗时（毫秒）。
    pub p95_ms: f64,
    /// 99 分位耗时（毫秒）。
    pub p99_ms: f64,
}

/// 具名阶段耗时剖析器：每个阶段一条独立样本环。
///
/// # 逻辑解析（How）
/// - 阶段表使用分片映射，单个环由互斥锁守护；`record` 的临界区只包含一次
///   环追加。
pub struct Profiler {
    capacity: usize,
    stages: DashMap<String, Mutex<MetricsRing>>,
}

impl Profiler {
    /// 以每阶段窗口容量构造剖析器。
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            stages: DashMap::new(),
        }
    }

    /// 记录一次阶段耗时。
    pub fn record(&self, stage: &str, duration: Duration) {
        let entry = self
            .stages
            .entry(stage.to_string())
            .or_insert_with(|| Mutex::new(MetricsRing::new(self.capacity)));
        entry.lock().append(duration.as_secs_f64() * 1_000.0);
    }

    /// 生成单个阶段的统计报告；无样本时返回 `None`。
    pub fn stage_report(&self, stage: &str) -> Option<StageReport> {
        let entry = self.stages.get(stage)?;
        let ring = entry.lock();
        if ring.is_empty() {
            return None;
        }
        Some(StageReport {
            stage: stage.to_string(),
            count: ring.count(),
            average_ms: ring.average().unwrap_or(0.0),
            p50_ms: ring.percentile(0.50).unwrap_or(0.0),
            p95_ms: ring.percentile(0.95).unwrap_or(0.0),
            p99_ms: ring.percentile(0.99).unwrap_or(0.0),
        })
    }

    /// 生成全部阶段的统计报告，按阶段名排序。
    pub fn report(&self) -> Vec<StageReport> {
        let mut names: Vec<String> = self.stages.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.stage_report(&name))
            .collect()
    }
}

impl std::fmt::Debug for Profiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profiler")
            .field("stages", &self.stages.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
