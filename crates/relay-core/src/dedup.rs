use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// 计算字节序列的 SHA-256 十六进制摘要，作为缺省指纹原语。
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// 命令指纹器：把命令映射为稳定字符串。
///
/// # 契约说明（What）
/// - 指纹必须由命令内容决定且稳定：同一命令多次取指纹结果一致；
/// - 推荐以 [`sha256_hex`] 对规范化后的命令字节取摘要，避免高基数原文外泄。
pub trait CommandFingerprinter<C>: Send + Sync + 'static {
    /// 计算命令指纹。
    fn fingerprint(&self, command: &C) -> String;
}

impl<C, F> CommandFingerprinter<C> for F
where
    F: Fn(&C) -> String + Send + Sync + 'static,
{
    fn fingerprint(&self, command: &C) -> String {
        self(command)
    }
}

/// 窗口内重复命令的处置策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum DuplicatePolicy {
    /// 以重复错误拒绝。
    Reject,
    /// 返回首次执行留存的结果。
    ReturnCached,
    /// 打上重复标记后照常放行。
    MarkAndProceed,
}

/// 去重引擎配置。
#[derive(Clone, Copy, Debug)]
pub struct DeduplicationConfig {
    /// 判定重复的时间窗口。
    pub window: Duration,
    /// 重复时的处置策略。
    pub policy: DuplicatePolicy,
}

/// 指纹判定的结果。
#[derive(Clone)]
#[non_exhaustive]
pub enum DedupOutcome {
    /// 新颖命令，照常执行。
    Proceed,
    /// 窗口内重复，已按策略要求标记后放行。
    ProceedMarked,
    /// 窗口内重复，应以重复错误拒绝。
    Rejected,
    /// 窗口内重复，返回留存结果（由调用方向下转型）。
    Cached(Arc<dyn Any + Send + Sync>),
}

impl std::fmt::Debug for DedupOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DedupOutcome::Proceed => write!(f, "Proceed"),
            DedupOutcome::ProceedMarked => write!(f, "ProceedMarked"),
            DedupOutcome::Rejected => write!(f, "Rejected"),
            DedupOutcome::Cached(_) => write!(f, "Cached(..)"),
        }
    }
}

struct DedupEntry {
    completed_at: Instant,
    result: Arc<dyn Any + Send + Sync>,
}

/// 基于指纹的近期重复抑制引擎。
///
/// # 逻辑解析（How）
/// - 条目在命令**完成**时写入，携带留存结果；超过窗口的条目视同不存在，
///   周期清扫负责真正回收。
/// - `evaluate` 把“是否重复”与配置策略合并为一个判定结果，调用方据此
///   拒绝、回放或打标放行。
///
/// # 风险提示（Trade-offs）
/// - `MarkAndProceed` 只负责打标，重复执行产生的副作用仍由业务自行裁决。
pub struct DeduplicationEngine {
    config: DeduplicationConfig,
    entries: DashMap<String, DedupEntry>,
}

impl DeduplicationEngine {
    /// 以配置构造引擎。
    pub fn new(config: DeduplicationConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    /// 读取配置。
    pub fn config(&self) -> DeduplicationConfig {
        self.config
    }

    /// 判定指纹并套用策略。
    pub fn evaluate(&self, fingerprint: &str) -> DedupOutcome {
        let Some(entry) = self.entries.get(fingerprint) else {
            return DedupOutcome::Proceed;
        };
        if entry.completed_at.elapsed() > self.config.window {
            return DedupOutcome::Proceed;
        }
        match self.config.policy {
            DuplicatePolicy::Reject => DedupOutcome::Rejected,
            DuplicatePolicy::ReturnCached => DedupOutcome::Cached(Arc::clone(&entry.result)),
            DuplicatePolicy::MarkAndProceed => DedupOutcome::ProceedMarked,
        }
    }

    /// 记录新颖命令的完成结果，开启其重复窗口。
    pub fn record_completion(&self, fingerprint: String, result: Arc<dyn Any + Send + Sync>) {
        self.entries.insert(
            fingerprint,
            DedupEntry {
                completed_at: Instant::now(),
                result,
            },
        );
    }

    /// 清扫窗口外的条目，返回回收数量。
    pub fn sweep(&self) -> usize {
        let window = self.config.window;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.completed_at.elapsed() <= window);
        before - self.entries.len()
    }

    /// 启动周期清扫任务；句柄丢弃即停止。
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let engine = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match engine.upgrade() {
                    Some(engine) => {
                        let removed = engine.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "去重引擎清扫了过期指纹");
                        }
                    }
                    None => break,
                }
            }
        });
        SweeperHandle { handle }
    }

    /// 当前条目数（含待清扫条目）。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for DeduplicationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeduplicationEngine")
            .field("entries", &self.entries.len())
            .field("window", &self.config.window)
            .finish()
    }
}

/// 周期清扫任务句柄；丢弃即停止。
#[derive(Debug)]
pub struct SweeperHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
