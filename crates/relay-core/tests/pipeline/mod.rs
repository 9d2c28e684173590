use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use relay_core::backpressure::{BackPressureConfig, BackPressureSemaphore, OverflowStrategy};
use relay_core::chain::{ExecutionPriority, Middleware, MiddlewareChain, Next};
use relay_core::command::{Command, CommandHandler, CommandMetadata, Interceptor};
use relay_core::context::CommandContext;
use relay_core::contract::Deadline;
use relay_core::error::{RelayError, codes};
use relay_core::executor::{Dispatcher, Pipeline};

#[derive(Clone, Debug)]
struct EchoCommand {
    payload: String,
}

impl Command for EchoCommand {
    type Result = String;
}

struct EchoHandler {
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl CommandHandler<EchoCommand> for EchoHandler {
    async fn handle(
        &self,
        command: EchoCommand,
        _ctx: &CommandContext,
    ) -> Result<String, RelayError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(command.payload.to_uppercase())
    }
}

struct FailingHandler;

#[async_trait]
impl CommandHandler<EchoCommand> for FailingHandler {
    async fn handle(
        &self,
        _command: EchoCommand,
        _ctx: &CommandContext,
    ) -> Result<String, RelayError> {
        Err(RelayError::new(codes::EXECUTION_FAILED, "下游处理失败"))
    }
}

/// 记录进入/返回顺序的透明中间件。
struct TracingStage {
    label: &'static str,
    priority: ExecutionPriority,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Middleware<EchoCommand> for TracingStage {
    fn priority(&self) -> ExecutionPriority {
        self.priority
    }

    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(self.label)
    }

    async fn execute(
        &self,
        command: EchoCommand,
        ctx: &CommandContext,
        next: Next<'_, EchoCommand>,
    ) -> Result<String, RelayError> {
        self.log.lock().push(format!("enter:{}", self.label));
        let result = next.run(command, ctx).await;
        self.log.lock().push(format!("exit:{}", self.label));
        result
    }
}

fn context() -> CommandContext {
    CommandContext::new(CommandMetadata::new())
}

/// 验证链路按优先级升序进入、按逆序返回，同档位保持注册顺序。
///
/// # 测试目标（Why）
/// - 以注册顺序 B(400)、A(100)、C(500) 构链，进入顺序必须是 A、B、C，
///   返回顺序必须是 C、B、A；
/// - 防止排序退化为不稳定排序或按注册顺序执行。
///
/// # 输入/输出契约（What）
/// - **前置条件**：三个透明中间件共享同一条执行日志；
/// - **后置条件**：日志精确等于嵌套进入/返回序列。
#[tokio::test]
async fn chain_enters_ascending_and_returns_descending() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let invocations = Arc::new(AtomicUsize::new(0));
    let pipeline = Pipeline::builder(EchoHandler {
        invocations: Arc::clone(&invocations),
    })
    .with_middleware(TracingStage {
        label: "b",
        priority: ExecutionPriority::Processing,
        log: Arc::clone(&log),
    })
    .with_middleware(TracingStage {
        label: "a",
        priority: ExecutionPriority::Authentication,
        log: Arc::clone(&log),
    })
    .with_middleware(TracingStage {
        label: "c",
        priority: ExecutionPriority::PostProcessing,
        log: Arc::clone(&log),
    })
    .build()
    .expect("链路构建应成功");

    let ctx = context();
    let result = pipeline
        .execute(
            EchoCommand {
                payload: "ping".to_string(),
            },
            &ctx,
        )
        .await
        .expect("执行应成功");

    assert_eq!(result, "PING");
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(
        *log.lock(),
        vec!["enter:a", "enter:b", "enter:c", "exit:c", "exit:b", "exit:a"],
        "进入顺序应为优先级升序，返回顺序应为逆序"
    );
}

/// 重复调用继续函数的违例中间件。
struct DoubleNextStage {
    second_error: Arc<Mutex<Option<&'static str>>>,
}

#[async_trait]
impl Middleware<EchoCommand> for DoubleNextStage {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("double-next")
    }

    async fn execute(
        &self,
        command: EchoCommand,
        ctx: &CommandContext,
        next: Next<'_, EchoCommand>,
    ) -> Result<String, RelayError> {
        let first = next.run(command.clone(), ctx).await;
        assert!(first.is_ok(), "首次调用继续函数应成功");
        match next.run(command, ctx).await {
            Ok(_) => panic!("第二次调用继续函数不应成功"),
            Err(error) => {
                *self.second_error.lock() = Some(error.code());
                Err(error)
            }
        }
    }
}

/// 验证继续函数的单次调用约束：第二次调用失败且下游不被重入。
///
/// # 测试步骤（How）
/// 1. 中间件第一次调用 `next` 成功；
/// 2. 第二次调用必须以 `chain.next_called_twice` 失败；
/// 3. 该错误原样浮出管道，处理器只被进入一次。
#[tokio::test]
async fn second_next_call_fails_and_downstream_runs_once() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let second_error = Arc::new(Mutex::new(None));
    let pipeline = Pipeline::builder(EchoHandler {
        invocations: Arc::clone(&invocations),
    })
    .with_middleware(DoubleNextStage {
        second_error: Arc::clone(&second_error),
    })
    .build()
    .expect("链路构建应成功");

    let ctx = context();
    let error = pipeline
        .execute(
            EchoCommand {
                payload: "ping".to_string(),
            },
            &ctx,
        )
        .await
        .expect_err("违例应浮出为错误");

    assert_eq!(error.code(), codes::NEXT_CALLED_TWICE);
    assert_eq!(*second_error.lock(), Some(codes::NEXT_CALLED_TWICE));
    assert_eq!(
        invocations.load(Ordering::SeqCst),
        1,
        "处理器不得因第二次调用被重入"
    );
}

/// 不调用继续函数直接短路的中间件。
struct ShortCircuitStage;

#[async_trait]
impl Middleware<EchoCommand> for ShortCircuitStage {
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed("short-circuit")
    }

    fn suppress_missing_next_warning(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        _command: EchoCommand,
        _ctx: &CommandContext,
        _next: Next<'_, EchoCommand>,
    ) -> Result<String, RelayError> {
        Ok("cached".to_string())
    }
}

/// 验证：短路（不调用继续函数）是合法行为而非失败。
#[tokio::test]
async fn short_circuit_without_next_is_legal() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let pipeline = Pipeline::builder(EchoHandler {
        invocations: Arc::clone(&invocations),
    })
    .with_middleware(ShortCircuitStage)
    .build()
    .expect("链路构建应成功");

    let ctx = context();
    let result = pipeline
        .execute(
            EchoCommand {
                payload: "ping".to_string(),
            },
            &ctx,
        )
        .await
        .expect("短路应成功返回");

    assert_eq!(result, "cached");
    assert_eq!(invocations.load(Ordering::SeqCst), 0, "处理器不应被进入");
}

struct SuffixInterceptor {
    suffix: &'static str,
}

impl Interceptor<EchoCommand> for SuffixInterceptor {
    fn intercept(
        &self,
        command: EchoCommand,
        _ctx: &CommandContext,
    ) -> Result<EchoCommand, RelayError> {
        Ok(EchoCommand {
            payload: format!("{}{}", command.payload, self.suffix),
        })
    }
}

/// 验证：拦截器按注册顺序串行折叠，链路收到最终变换结果。
#[tokio::test]
async fn interceptors_fold_in_registration_order() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let pipeline = Pipeline::builder(EchoHandler {
        invocations: Arc::clone(&invocations),
    })
    .with_interceptor(SuffixInterceptor { suffix: "-1" })
    .with_interceptor(SuffixInterceptor { suffix: "-2" })
    .build()
    .expect("链路构建应成功");

    let ctx = context();
    let result = pipeline
        .execute(
            EchoCommand {
                payload: "cmd".to_string(),
            },
            &ctx,
        )
        .await
        .expect("执行应成功");
    assert_eq!(result, "CMD-1-2");
}

/// 验证：已取消的上下文在进入链路前即失败，处理器不被调用。
#[tokio::test]
async fn cancelled_context_fails_before_chain() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let pipeline = Pipeline::builder(EchoHandler {
        invocations: Arc::clone(&invocations),
    })
    .build()
    .expect("链路构建应成功");

    let ctx = context();
    ctx.cancellation().cancel();
    let error = pipeline
        .execute(
            EchoCommand {
                payload: "ping".to_string(),
            },
            &ctx,
        )
        .await
        .expect_err("取消应导致失败");

    assert_eq!(error.code(), codes::CANCELLED);
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

/// 验证：过期的截止时间在中间件边界被强制执行。
#[tokio::test(start_paused = true)]
async fn expired_deadline_fails_at_boundary() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let pipeline = Pipeline::builder(EchoHandler {
        invocations: Arc::clone(&invocations),
    })
    .build()
    .expect("链路构建应成功");

    let ctx = context().with_deadline(Deadline::after(Duration::from_millis(10)));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let error = pipeline
        .execute(
            EchoCommand {
                payload: "ping".to_string(),
            },
            &ctx,
        )
        .await
        .expect_err("超过截止时间应失败");

    assert_eq!(error.code(), codes::DEADLINE_EXCEEDED);
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

/// 验证：链路长度超过上限在构建期失败。
#[tokio::test]
async fn chain_depth_limit_is_enforced_at_build() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let middlewares: Vec<Arc<dyn Middleware<EchoCommand>>> = vec![
        Arc::new(TracingStage {
            label: "a",
            priority: ExecutionPriority::Authentication,
            log: Arc::clone(&log),
        }),
        Arc::new(TracingStage {
            label: "b",
            priority: ExecutionPriority::Processing,
            log,
        }),
    ];
    let handler: Arc<dyn CommandHandler<EchoCommand>> = Arc::new(EchoHandler {
        invocations: Arc::new(AtomicUsize::new(0)),
    });

    let error = MiddlewareChain::build(middlewares, handler, 1).expect_err("超深链路应被拒绝");
    assert_eq!(error.code(), codes::CHAIN_DEPTH_EXCEEDED);
}

/// 验证：失败路径同样释放准入令牌，后续执行不被饿死。
///
/// # 测试步骤（How）
/// 1. 并发上限为 1 的信号量挂接到管道；
/// 2. 第一次执行以处理器失败结束；
/// 3. 第二次执行立即获得令牌并成功，证明失败路径已释放。
#[tokio::test]
async fn admission_token_released_on_failure_path() {
    let semaphore = BackPressureSemaphore::new(BackPressureConfig::new(
        1,
        OverflowStrategy::Refuse,
    ))
    .expect("配置合法");

    let failing = Pipeline::builder(FailingHandler)
        .with_back_pressure(semaphore.clone())
        .build()
        .expect("链路构建应成功");

    let ctx = context();
    let error = failing
        .execute(
            EchoCommand {
                payload: "ping".to_string(),
            },
            &ctx,
        )
        .await
        .expect_err("处理器应失败");
    assert_eq!(error.code(), codes::EXECUTION_FAILED);

    let invocations = Arc::new(AtomicUsize::new(0));
    let succeeding = Pipeline::builder(EchoHandler {
        invocations: Arc::clone(&invocations),
    })
    .with_back_pressure(semaphore.clone())
    .build()
    .expect("链路构建应成功");

    succeeding
        .execute(
            EchoCommand {
                payload: "pong".to_string(),
            },
            &ctx,
        )
        .await
        .expect("令牌若已释放，本次执行应立即成功");
    assert_eq!(semaphore.snapshot().active, 0, "退出后不应残留活跃令牌");
}

/// 验证：注册表按命令类型路由，未注册类型得到稳定错误。
#[tokio::test]
async fn dispatcher_routes_registered_command_types() {
    #[derive(Clone, Debug)]
    struct OtherCommand;
    impl Command for OtherCommand {
        type Result = u32;
    }

    let dispatcher = Dispatcher::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    dispatcher
        .register_handler(EchoHandler {
            invocations: Arc::clone(&invocations),
        })
        .expect("注册应成功");

    let ctx = context();
    let result = dispatcher
        .execute(
            EchoCommand {
                payload: "route".to_string(),
            },
            &ctx,
        )
        .await
        .expect("已注册类型应被路由");
    assert_eq!(result, "ROUTE");

    let error = dispatcher
        .execute(OtherCommand, &ctx)
        .await
        .expect_err("未注册类型应失败");
    assert_eq!(error.code(), codes::EXECUTION_FAILED);
}
