use std::time::SystemTime;

use async_trait::async_trait;
use uuid::Uuid;

use crate::context::CommandContext;
use crate::error::RelayError;

/// 命令契约：描述一次意图的不可变值，携带关联的结果类型。
///
/// # 设计背景（Why）
/// - 管道以单一命令类型组合整条链路，类型系统在编译期即保证 Handler 与
///   中间件对结果类型的一致认知，避免运行期的反射式匹配。
///
/// # 契约说明（What）
/// - 实现类型应当是不可变值；链路各阶段之间传递的是所有权或克隆副本。
/// - `Send + Sync + 'static` 约束保证命令可以安全地跨任务共享。
///
/// # 风险提示（Trade-offs）
/// - 需要重放能力的组件（如重试、缓存回源）会额外要求 `Clone`；约束施加在
///   组件一侧而非此处，保持最小契约。
pub trait Command: Send + Sync + 'static {
    /// 命令完成后产出的结果类型。
    type Result: Send + Sync + 'static;
}

/// 命令元数据：调用方生成或默认构造的不可变描述。
///
/// # 契约说明（What）
/// - `id` 默认以 UUIDv4 生成；`created_at` 记录构造时刻的壁钟时间。
/// - `user_id` 与 `correlation_id` 均为可选；相关性标识缺省时由执行上下文
///   补齐，保证事件始终可以归组。
#[derive(Clone, Debug)]
pub struct CommandMetadata {
    id: Uuid,
    created_at: SystemTime,
    user_id: Option<String>,
    correlation_id: Option<String>,
}

impl CommandMetadata {
    /// 以随机标识构造元数据。
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: SystemTime::now(),
            user_id: None,
            correlation_id: None,
        }
    }

    /// 设置用户标识。
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// 设置相关性标识。
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// 获取命令标识。
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// 获取构造时刻。
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// 获取用户标识。
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// 获取相关性标识。
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }
}

impl Default for CommandMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// 终端处理器：链路的最后一环，将命令转化为结果。
///
/// # 契约说明（What）
/// - `handle` 是整条链路的终点；中间件对 `next` 的最后一次调用最终抵达此处。
/// - 实现不得在内部吞掉取消或截止错误之外的异常語义：错误按原样上抛，由
///   链路外层的策略组件决定是否重写。
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    /// 处理命令并产出结果。
    async fn handle(&self, command: C, ctx: &CommandContext) -> Result<C::Result, RelayError>;
}

/// 拦截器：执行器入口处的纯前置变换。
///
/// # 设计背景（Why）
/// - 在进入链路与背压控制之前，有些调整只关心命令本身（补齐默认值、规范化
///   字段）。拦截器以同类型映射表达这类变换，保持与中间件职责的边界清晰。
///
/// # 契约说明（What）
/// - `intercept` 必须返回同一命令类型；不关心该命令的拦截器原样放行。
/// - 拦截器按注册顺序串行执行；后一个拦截器收到的命令值即前一个的返回值。
/// - 拦截器不得产生副作用依赖：失败时整次执行终止，不进入链路。
pub trait Interceptor<C: Command>: Send + Sync + 'static {
    /// 对命令做同类型变换；不适用时原样返回。
    fn intercept(&self, command: C, ctx: &CommandContext) -> Result<C, RelayError>;

    /// 拦截器的稳定名称，用于诊断日志。
    fn name(&self) -> &str {
        "anonymous.interceptor"
    }
}
