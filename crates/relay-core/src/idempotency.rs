use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::codec::ResultCodec;
use crate::contract::Cancellation;
use crate::error::{RelayError, codes};

/// 幂等记录的落盘状态。
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum IdempotencyStatus {
    /// 执行仍在进行中。
    InProgress,
    /// 执行成功，保存编码后的结果字节。
    Completed(Vec<u8>),
    /// 执行失败，保存错误摘要。
    Failed(ErrorDescriptor),
}

/// 可落盘的错误摘要。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorDescriptor {
    /// 稳定错误码。
    pub code: String,
    /// 人类可读描述。
    pub message: String,
}

impl From<&RelayError> for ErrorDescriptor {
    fn from(error: &RelayError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.message().to_string(),
        }
    }
}

/// 幂等记录：键、状态与生存期。
#[derive(Clone, Debug)]
pub struct IdempotencyRecord {
    /// 幂等键。
    pub key: String,
    /// 当前状态。
    pub status: IdempotencyStatus,
    /// 创建时刻。
    pub created_at: Instant,
    /// 过期时刻；过期记录视同不存在。
    pub expires_at: Instant,
}

impl IdempotencyRecord {
    fn with_status(key: &str, status: IdempotencyStatus, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            key: key.to_string(),
            status,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// 构造进行中记录。
    pub fn in_progress(key: &str, ttl: Duration) -> Self {
        Self::with_status(key, IdempotencyStatus::InProgress, ttl)
    }

    /// 构造完成记录。
    pub fn completed(key: &str, value: Vec<u8>, ttl: Duration) -> Self {
        Self::with_status(key, IdempotencyStatus::Completed(value), ttl)
    }

    /// 构造失败记录。
    pub fn failed(key: &str, descriptor: ErrorDescriptor, ttl: Duration) -> Self {
        Self::with_status(key, IdempotencyStatus::Failed(descriptor), ttl)
    }

    /// 是否已过期。
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// 幂等存储协议。
///
/// # 契约说明（What）
/// - `get` 不得返回已过期记录（过期即缺失）；
/// - 实现需保证对同一键的状态迁移彼此可串行化；
/// - `cleanup_expired` 回收过期记录，调用频率由上层决定。
#[async_trait]
pub trait IdempotencyStore: Send + Sync + 'static {
    /// 读取键对应的未过期记录。
    async fn get(&self, key: &str) -> Option<IdempotencyRecord>;

    /// 写入（覆盖）键对应的记录。
    async fn set(&self, key: &str, record: IdempotencyRecord);

    /// 删除键对应的记录。
    async fn remove(&self, key: &str);

    /// 回收全部过期记录。
    async fn cleanup_expired(&self);
}

/// 进程内幂等存储。
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    entries: DashMap<String, IdempotencyRecord>,
}

impl InMemoryIdempotencyStore {
    /// 创建空存储。
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前记录条数（含待回收的过期记录）。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Option<IdempotencyRecord> {
        let record = self.entries.get(key)?;
        if record.is_expired() {
            return None;
        }
        Some(record.clone())
    }

    async fn set(&self, key: &str, record: IdempotencyRecord) {
        self.entries.insert(key.to_string(), record);
    }

    async fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    async fn cleanup_expired(&self) {
        self.entries.retain(|_, record| !record.is_expired());
    }
}

/// 幂等协调器配置。
#[derive(Clone, Copy, Debug)]
pub struct IdempotencyConfig {
    /// 记录生存期。
    pub ttl: Duration,
    /// 观察到进行中记录时是否等待对端完成。
    pub wait_for_in_progress: bool,
    /// 等待对端时的轮询间隔。
    pub poll_interval: Duration,
    /// 等待对端的总时长上限；超时后按抢占路径继续。
    pub wait_timeout: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            wait_for_in_progress: true,
            poll_interval: Duration::from_millis(50),
            wait_timeout: Duration::from_secs(30),
        }
    }
}

/// 键控的至多一次执行协调器，带在途汇合。
///
/// # 设计背景（Why）
/// - 重复提交同一业务键的命令时，只有第一次应真正执行；并发到达的后来者
///   要么等待在途结果（汇合），要么立即得到冲突错误。
///
/// # 逻辑解析（How）
/// - 读取路径（新鲜的完成记录直接返回、失败记录允许重试）是粗粒度的
///   check-then-act；真正的占据动作在**每键串行门**内完成二次校验后写入
///   `InProgress`，保证同一协调器上同一键至多一条在途记录。
/// - 等待路径以固定间隔轮询存储，直至对端完成（返回其值）、记录消失或
///   超时（按抢占路径继续）；等待期间收到取消信号立即以取消错误退出，
///   在途对端不受影响。
///
/// # 契约说明（What）
/// - 成功后在 TTL 内重复调用返回相等的值且不再执行被包裹的操作；
/// - `wait_for_in_progress=false` 时观察到在途记录立即以
///   [`codes::OPERATION_IN_PROGRESS`] 失败；
/// - 结果编码失败时移除占据记录并照常返回本次执行的结果，不让编码问题
///   阻塞后续请求。
pub struct IdempotencyCoordinator<S> {
    store: Arc<S>,
    config: IdempotencyConfig,
    gates: DashMap<String, Arc<Mutex<()>>>,
}

impl<S: IdempotencyStore> IdempotencyCoordinator<S> {
    /// 以存储与配置构造协调器。
    pub fn new(store: Arc<S>, config: IdempotencyConfig) -> Self {
        Self {
            store,
            config,
            gates: DashMap::new(),
        }
    }

    /// 访问底层存储。
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// 按幂等键执行操作；语义见类型级文档。
    pub async fn execute<R, F, Fut>(
        &self,
        key: &str,
        codec: &ResultCodec<R>,
        cancellation: &Cancellation,
        op: F,
    ) -> Result<R, RelayError>
    where
        R: Send,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, RelayError>>,
    {
        // 阶段一：循环直到返回既有结果，或成功占据 InProgress。
        loop {
            if cancellation.is_cancelled() {
                return Err(RelayError::cancelled());
            }

            if let Some(record) = self.store.get(key).await {
                match record.status {
                    IdempotencyStatus::Completed(bytes) => {
                        // 解码失败视作类型不匹配，按缺失处理继续抢占。
                        if let Ok(value) = codec.decode(&bytes) {
                            return Ok(value);
                        }
                    }
                    IdempotencyStatus::Failed(_) => {
                        // 失败记录允许重试，落入抢占路径。
                    }
                    IdempotencyStatus::InProgress => {
                        if !self.config.wait_for_in_progress {
                            return Err(RelayError::new(
                                codes::OPERATION_IN_PROGRESS,
                                format!("幂等键 {key} 的执行仍在进行中"),
                            ));
                        }
                        if let Some(value) = self.wait_for_peer(key, codec, cancellation).await? {
                            return Ok(value);
                        }
                        // 等待超时或对端失败：继续抢占。
                    }
                }
            }

            if self.try_claim(key, codec).await? {
                break;
            }
            // 门内观察到他人占据，回到等待/快速路径。
        }

        // 阶段二：真正执行，并把结果落盘。
        match op().await {
            Ok(value) => {
                match codec.encode(&value) {
                    Ok(bytes) => {
                        self.store
                            .set(
                                key,
                                IdempotencyRecord::completed(key, bytes, self.config.ttl),
                            )
                            .await;
                    }
                    Err(error) => {
                        tracing::warn!(
                            key,
                            code = error.code(),
                            "幂等结果编码失败，移除占据记录"
                        );
                        self.store.remove(key).await;
                    }
                }
                self.release_gate(key);
                Ok(value)
            }
            Err(error) => {
                self.store
                    .set(
                        key,
                        IdempotencyRecord::failed(key, (&error).into(), self.config.ttl),
                    )
                    .await;
                self.release_gate(key);
                Err(error)
            }
        }
    }

    /// 在每键串行门内做二次校验并写入 `InProgress`；返回是否占据成功。
    async fn try_claim<R>(&self, key: &str, codec: &ResultCodec<R>) -> Result<bool, RelayError> {
        let gate = self
            .gates
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        if let Some(record) = self.store.get(key).await {
            match record.status {
                IdempotencyStatus::InProgress => return Ok(false),
                IdempotencyStatus::Completed(ref bytes) => {
                    if codec.decode(bytes).is_ok() {
                        // 对端在门外窗口期内已完成；让上层快速路径返回其值。
                        return Ok(false);
                    }
                }
                IdempotencyStatus::Failed(_) => {}
            }
        }
        self.store
            .set(key, IdempotencyRecord::in_progress(key, self.config.ttl))
            .await;
        Ok(true)
    }

    /// 轮询等待在途对端；返回 `Ok(Some)` 表示取得对端结果，
    /// `Ok(None)` 表示应继续抢占（超时、记录消失或对端失败）。
    async fn wait_for_peer<R>(
        &self,
        key: &str,
        codec: &ResultCodec<R>,
        cancellation: &Cancellation,
    ) -> Result<Option<R>, RelayError> {
        let deadline = Instant::now() + self.config.wait_timeout;
        loop {
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = cancellation.cancelled() => {
                    // 等待者退出不影响在途对端。
                    return Err(RelayError::cancelled());
                }
            }
            match self.store.get(key).await {
                Some(record) => match record.status {
                    IdempotencyStatus::Completed(bytes) => {
                        if let Ok(value) = codec.decode(&bytes) {
                            return Ok(Some(value));
                        }
                        return Ok(None);
                    }
                    IdempotencyStatus::Failed(_) => return Ok(None),
                    IdempotencyStatus::InProgress => {}
                },
                None => return Ok(None),
            }
        }
    }

    fn release_gate(&self, key: &str) {
        // 只在没有其他持有者时回收门对象，避免按键无限增长。
        self.gates
            .remove_if(key, |_, gate| Arc::strong_count(gate) == 1);
    }
}

impl<S> std::fmt::Debug for IdempotencyCoordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyCoordinator")
            .field("gates", &self.gates.len())
            .finish()
    }
}
