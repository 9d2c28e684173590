use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::codec::ResultCodec;
use crate::error::RelayError;

/// 缓存后端契约：键到不透明字节的存取。
///
/// # 契约说明（What）
/// - `get` 不得返回已过期条目；
/// - `set` 的 `expires_at` 为 `None` 时条目不过期；
/// - 实现必须可跨任务并发调用。
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// 读取键对应的未过期字节。
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// 写入键对应的字节与过期时刻。
    async fn set(&self, key: &str, value: Vec<u8>, expires_at: Option<Instant>);

    /// 删除键。
    async fn remove(&self, key: &str);

    /// 清空全部条目。
    async fn clear(&self);
}

struct CacheEntry {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() >= expires_at)
    }
}

/// 进程内缓存后端。
#[derive(Default)]
pub struct InMemoryCacheBackend {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryCacheBackend {
    /// 创建空后端。
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前条目数（含待回收的过期条目）。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            return None;
        }
        Some(entry.bytes.clone())
    }

    async fn set(&self, key: &str, value: Vec<u8>, expires_at: Option<Instant>) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                bytes: value,
                expires_at,
            },
        );
    }

    async fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    async fn clear(&self) {
        self.entries.clear();
    }
}

impl std::fmt::Debug for InMemoryCacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCacheBackend")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// 缓存协调器配置。
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    /// 条目生存期。
    pub ttl: Duration,
    /// 是否启用单飞：同键并发未命中共享一次回源计算。
    pub single_flight: bool,
}

/// 一次取值的缓存视角结论。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CacheOutcome {
    /// 初查即命中。
    Hit,
    /// 初查未命中；`stored` 表示本次调用是否完成了回填。
    ///
    /// 单飞跟随者拿到的是领跑者回填的值，但对外仍计为一次未命中
    /// （`stored = false`），命中只描述初查结论。
    Miss {
        /// 本次调用是否把结果写回了缓存。
        stored: bool,
    },
}

/// 键控结果备忘协调器：取值、回源、回填与可选单飞。
///
/// # 设计背景（Why）
/// - 缓存未命中时的并发回源会放大下游压力；单飞让同键并发未命中只执行
///   一次计算，其余调用共享结果。
///
/// # 逻辑解析（How）
/// - 初查命中即返回；解码失败按**软性未命中**处理：告警、删除坏条目、
///   照常回源并重新回填。
/// - 单飞以每键异步互斥锁实现：领跑者持锁计算并回填；跟随者获锁后复查
///   缓存，命中则直接取值（对外仍计未命中）。领跑者失败时锁自然释放，
///   下一位等待者接棒计算，失败不会被缓存。
///
/// # 契约说明（What）
/// - 协调器只缓存成功结果；错误一律透传，不落盘；
/// - 编码失败只放弃回填（告警），不影响本次返回值。
pub struct CacheCoordinator<B> {
    backend: Arc<B>,
    config: CacheConfig,
    flights: DashMap<String, Arc<Mutex<()>>>,
}

impl<B: CacheBackend> CacheCoordinator<B> {
    /// 以后端与配置构造协调器。
    pub fn new(backend: Arc<B>, config: CacheConfig) -> Self {
        Self {
            backend,
            config,
            flights: DashMap::new(),
        }
    }

    /// 访问底层后端。
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// 读取配置。
    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// 取值或回源计算；返回值与缓存视角结论。
    pub async fn get_or_compute<R, F, Fut>(
        &self,
        key: &str,
        codec: &ResultCodec<R>,
        compute: F,
    ) -> Result<(R, CacheOutcome), RelayError>
    where
        R: Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, RelayError>>,
    {
        if let Some(value) = self.lookup(key, codec).await {
            return Ok((value, CacheOutcome::Hit));
        }

        if !self.config.single_flight {
            let value = compute().await?;
            let stored = self.store(key, codec, &value).await;
            return Ok((value, CacheOutcome::Miss { stored }));
        }

        let flight = self
            .flights
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let outcome = {
            let _leader = flight.lock().await;
            // 复查：领跑者可能已经回填。
            if let Some(value) = self.lookup(key, codec).await {
                Ok((value, CacheOutcome::Miss { stored: false }))
            } else {
                match compute().await {
                    Ok(value) => {
                        let stored = self.store(key, codec, &value).await;
                        Ok((value, CacheOutcome::Miss { stored }))
                    }
                    Err(error) => Err(error),
                }
            }
        };
        self.flights
            .remove_if(key, |_, flight| Arc::strong_count(flight) == 1);
        outcome
    }

    /// 删除键对应的条目。
    pub async fn invalidate(&self, key: &str) {
        self.backend.remove(key).await;
    }

    /// 清空缓存。
    pub async fn clear(&self) {
        self.backend.clear().await;
    }

    async fn lookup<R>(&self, key: &str, codec: &ResultCodec<R>) -> Option<R> {
        let bytes = self.backend.get(key).await?;
        match codec.decode(&bytes) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::warn!(key, code = error.code(), "缓存条目解码失败，按未命中恢复");
                self.backend.remove(key).await;
                None
            }
        }
    }

    async fn store<R>(&self, key: &str, codec: &ResultCodec<R>, value: &R) -> bool {
        match codec.encode(value) {
            Ok(bytes) => {
                self.backend
                    .set(key, bytes, Some(Instant::now() + self.config.ttl))
                    .await;
                true
            }
            Err(error) => {
                tracing::warn!(key, code = error.code(), "结果编码失败，放弃缓存回填");
                false
            }
        }
    }
}

impl<B> std::fmt::Debug for CacheCoordinator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("single_flight", &self.config.single_flight)
            .field("ttl", &self.config.ttl)
            .finish()
    }
}
