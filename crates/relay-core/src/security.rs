use std::time::SystemTime;

/// 密钥材料：标识、字节与创建时刻。
///
/// # 契约说明（What）
/// - `id` 在密钥库内唯一且稳定，事件与密文头部仅引用该标识，绝不携带字节；
/// - 持有方负责在丢弃前清理敏感字节（本结构不做自动擦除）。
#[derive(Clone)]
pub struct KeyMaterial {
    /// 密钥标识。
    pub id: String,
    /// 密钥字节。
    pub bytes: Vec<u8>,
    /// 创建时刻，用于轮换与过期回收。
    pub created_at: SystemTime,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 字节内容不进入调试输出。
        f.debug_struct("KeyMaterial")
            .field("id", &self.id)
            .field("len", &self.bytes.len())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// 加密类中间件依赖的密钥库契约（仅协议，本仓库不提供实现）。
///
/// # 设计背景（Why）
/// - 加密原语属于外部协作者；内核只约定密钥的存取与轮换语义，使加密
///   中间件可以在不同密钥管理体系（KMS、HSM、文件）之间移植。
///
/// # 契约说明（What）
/// - `current_key` / `current_key_id`：返回当前轮换位上的密钥与标识；
/// - `store`：登记新密钥并将其置为当前；
/// - `key`：按标识取回历史密钥，供解密旧密文使用；
/// - `remove_expired_keys`：回收早于给定时刻创建的密钥。
///
/// # 风险提示（Trade-offs）
/// - 回收历史密钥会使对应密文不可解，轮换与回收窗口需由部署方统筹。
pub trait KeyStore: Send + Sync + 'static {
    /// 当前密钥。
    fn current_key(&self) -> Option<KeyMaterial>;

    /// 当前密钥标识。
    fn current_key_id(&self) -> Option<String>;

    /// 登记新密钥并置为当前。
    fn store(&self, key: KeyMaterial);

    /// 按标识取回密钥。
    fn key(&self, id: &str) -> Option<KeyMaterial>;

    /// 回收早于 `before` 创建的密钥。
    fn remove_expired_keys(&self, before: SystemTime);
}
