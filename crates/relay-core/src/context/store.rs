use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// 类型化键契约：以键类型的身份索引上下文条目。
///
/// # 设计背景（Why）
/// - 字符串键在多组件共存时容易碰撞且无法表达值类型；以程序内声明的空类型
///   作为键，`TypeId` 即运行期身份，`Value` 关联类型则在编译期锁定取值类型。
///
/// # 契约说明（What）
/// - 键类型本身不承载数据，推荐声明为零尺寸类型；
/// - `Value` 必须满足 `Send + Sync + 'static`，保证条目可跨任务共享。
///
/// # 使用示例
/// ```
/// use relay_core::context::{ContextKey, ContextStore};
///
/// struct TenantId;
/// impl ContextKey for TenantId {
///     type Value = String;
/// }
///
/// let store = ContextStore::new();
/// store.set::<TenantId>(Some("acme".to_string()));
/// assert_eq!(store.get::<TenantId>().as_deref(), Some(&"acme".to_string()));
/// ```
pub trait ContextKey: 'static {
    /// 与键类型绑定的取值类型。
    type Value: Send + Sync + 'static;
}

type ErasedValue = Arc<dyn Any + Send + Sync>;

/// 类型化异构存储：每次管道执行的共享状态容器。
///
/// # 设计背景（Why）
/// - 中间件之间需要传递彼此不可见的状态（鉴权结果、限速配额、缓存标记），
///   以 `TypeId` 为键、以不透明 `Arc` 为值的映射提供类型安全的共享点。
///
/// # 逻辑解析（How）
/// - 所有读写都在单把互斥锁内完成，临界区只包含映射操作本身，不执行任何
///   用户回调（[`ContextStore::update`] 的批量闭包除外，该闭包即原子块契约）。
/// - 值以 `Arc` 承载：写入即整体替换条目，因此 [`ContextStore::fork`] 的浅拷贝
///   天然隔离——分叉后替换条目不会影响父方，仅共享的 `Arc` 单元保持共享。
///
/// # 契约说明（What）
/// - `set(None)` 等价于删除；`get` 返回条目的 `Arc` 克隆；
/// - `snapshot` 在锁内一次性拷贝映射，得到时间点一致的只读视图；
/// - 任何单次操作的耗时与受影响条目数成正比，不存在无界阻塞。
///
/// # 风险提示（Trade-offs）
/// - 跨键类型的序列化需要调用方自备编解码；存储自身不做任何编码。
pub struct ContextStore {
    entries: Mutex<HashMap<TypeId, ErasedValue>>,
}

impl ContextStore {
    /// 创建空存储。
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 读取键对应的值；不存在时返回 `None`。
    pub fn get<K: ContextKey>(&self) -> Option<Arc<K::Value>> {
        let entries = self.entries.lock();
        entries
            .get(&TypeId::of::<K>())
            .cloned()
            .and_then(|value| value.downcast::<K::Value>().ok())
    }

    /// 写入键对应的值；`None` 表示删除该条目。
    pub fn set<K: ContextKey>(&self, value: Option<K::Value>) {
        let mut entries = self.entries.lock();
        match value {
            Some(value) => {
                entries.insert(TypeId::of::<K>(), Arc::new(value));
            }
            None => {
                entries.remove(&TypeId::of::<K>());
            }
        }
    }

    /// 以共享引用写入，供需要与其他持有方共享同一单元的场景使用。
    pub fn set_shared<K: ContextKey>(&self, value: Arc<K::Value>) {
        let mut entries = self.entries.lock();
        entries.insert(TypeId::of::<K>(), value);
    }

    /// 判断键是否存在。
    pub fn contains<K: ContextKey>(&self) -> bool {
        self.entries.lock().contains_key(&TypeId::of::<K>())
    }

    /// 删除键并返回被移除的值。
    pub fn remove<K: ContextKey>(&self) -> Option<Arc<K::Value>> {
        let mut entries = self.entries.lock();
        entries
            .remove(&TypeId::of::<K>())
            .and_then(|value| value.downcast::<K::Value>().ok())
    }

    /// 当前条目数量。
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// 在锁内执行批量读写，整个闭包构成一个原子块。
    ///
    /// # 风险提示（Trade-offs）
    /// - 闭包在持锁状态下运行，不得执行阻塞或挂起操作，否则将拖慢同一上下文
    ///   上的所有并发访问。
    pub fn update<R>(&self, f: impl FnOnce(&mut StoreGuard<'_>) -> R) -> R {
        let mut entries = self.entries.lock();
        let mut guard = StoreGuard {
            entries: &mut entries,
        };
        f(&mut guard)
    }

    /// 原子地拷贝当前全部条目，得到时间点一致的只读快照。
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            entries: self.entries.lock().clone(),
        }
    }

    /// 分叉：一次性拷贝映射，得到后续互不影响的新存储。
    pub fn fork(&self) -> ContextStore {
        ContextStore {
            entries: Mutex::new(self.entries.lock().clone()),
        }
    }

    /// 清空全部条目。
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextStore")
            .field("entries", &self.len())
            .finish()
    }
}

/// [`ContextStore::update`] 原子块内的类型化访问器。
pub struct StoreGuard<'a> {
    entries: &'a mut HashMap<TypeId, ErasedValue>,
}

impl StoreGuard<'_> {
    /// 读取键对应的值。
    pub fn get<K: ContextKey>(&self) -> Option<Arc<K::Value>> {
        self.entries
            .get(&TypeId::of::<K>())
            .cloned()
            .and_then(|value| value.downcast::<K::Value>().ok())
    }

    /// 写入键对应的值；`None` 表示删除。
    pub fn set<K: ContextKey>(&mut self, value: Option<K::Value>) {
        match value {
            Some(value) => {
                self.entries.insert(TypeId::of::<K>(), Arc::new(value));
            }
            None => {
                self.entries.remove(&TypeId::of::<K>());
            }
        }
    }

    /// 删除键。
    pub fn remove<K: ContextKey>(&mut self) {
        self.entries.remove(&TypeId::of::<K>());
    }

    /// 判断键是否存在。
    pub fn contains<K: ContextKey>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<K>())
    }
}

/// 某一时间点的只读条目视图。
pub struct ContextSnapshot {
    entries: HashMap<TypeId, ErasedValue>,
}

impl ContextSnapshot {
    /// 读取快照中的值。
    pub fn get<K: ContextKey>(&self) -> Option<Arc<K::Value>> {
        self.entries
            .get(&TypeId::of::<K>())
            .cloned()
            .and_then(|value| value.downcast::<K::Value>().ok())
    }

    /// 快照内条目数量。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 快照是否为空。
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
