//! 行为引擎：每个 Agent 惰性创建一个，运行相互并发、受 Semaphore 限流
//!
//! 运行的取消令牌是 Agent token 的子 token；Agent 停止时 `stop` 取消并回收所有运行。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{interpolate, Behavior, Statement};
use crate::actors::{CoreMessage, Message, Parameters, ScopeChannel, ScopeEvent};

/// 行为运行 ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RunId(u64);

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

impl RunId {
    fn next() -> Self {
        Self(NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// 给所属 Agent 投递基础消息
pub(crate) type Poster = Arc<dyn Fn(CoreMessage) + Send + Sync>;

#[derive(Debug)]
enum RunError {
    Cancelled,
    Failed(String),
}

#[derive(Clone)]
struct RunContext {
    agent: Arc<str>,
    scope: Arc<str>,
    token: CancellationToken,
    poster: Poster,
    channel: ScopeChannel,
}

pub struct BehaviorVm {
    context: RunContext,
    permits: Arc<Semaphore>,
    runs: JoinSet<()>,
}

impl BehaviorVm {
    pub(crate) fn new(
        agent: &str,
        scope: &str,
        token: CancellationToken,
        max_concurrent: usize,
        poster: Poster,
        channel: ScopeChannel,
    ) -> Self {
        debug!(agent, "behavior engine created");
        Self {
            context: RunContext {
                agent: Arc::from(agent),
                scope: Arc::from(scope),
                token,
                poster,
                channel,
            },
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            runs: JoinSet::new(),
        }
    }

    /// 异步启动一次运行，立即返回
    pub fn run(&mut self, behavior: Behavior, inputs: Parameters) -> RunId {
        self.reap();
        let id = RunId::next();
        let context = self.context.clone();
        let permits = self.permits.clone();
        self.runs.spawn(async move {
            let permit = tokio::select! {
                _ = context.token.cancelled() => return,
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            let urn = behavior.urn.clone();
            let result = execute(&behavior, inputs, &context).await;
            drop(permit);
            match result {
                Ok(()) => debug!(agent = %context.agent, behavior = %urn, run = id.0, "behavior finished"),
                Err(RunError::Cancelled) => debug!(agent = %context.agent, behavior = %urn, run = id.0, "behavior cancelled"),
                Err(RunError::Failed(reason)) => {
                    error!(agent = %context.agent, behavior = %urn, run = id.0, error = %reason, "behavior failed");
                    context.channel.send(Message::new(ScopeEvent::Error {
                        scope: context.scope.to_string(),
                        message: format!("behavior {} failed: {}", urn, reason),
                    }));
                }
            }
        });
        id
    }

    /// 未结束的运行数
    pub fn active_runs(&mut self) -> usize {
        self.reap();
        self.runs.len()
    }

    /// 取消并等待所有运行结束
    pub async fn stop(mut self) {
        self.context.token.cancel();
        while let Some(joined) = self.runs.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    warn!(agent = %self.context.agent, "behavior run panicked");
                }
            }
        }
        debug!(agent = %self.context.agent, "behavior engine stopped");
    }

    fn reap(&mut self) {
        while self.runs.try_join_next().is_some() {}
    }
}

async fn execute(behavior: &Behavior, mut variables: Parameters, context: &RunContext) -> Result<(), RunError> {
    for statement in &behavior.statements {
        if context.token.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        match statement {
            Statement::Set { key, value } => {
                variables.insert(key.clone(), value.clone());
            }
            Statement::SetAgentState { key, value } => {
                (context.poster)(CoreMessage::SetState {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
            Statement::Emit { text } => {
                context.channel.send(Message::new(ScopeEvent::BehaviorOutput {
                    scope: context.scope.to_string(),
                    behavior: behavior.urn.clone(),
                    text: interpolate(text, &variables),
                }));
            }
            Statement::Log { text } => {
                info!(agent = %context.agent, behavior = %behavior.urn, "{}", interpolate(text, &variables));
            }
            Statement::Sleep { millis } => {
                tokio::select! {
                    _ = context.token.cancelled() => return Err(RunError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(*millis)) => {}
                }
            }
            Statement::Fail { reason } => return Err(RunError::Failed(interpolate(reason, &variables))),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn vm(max: usize) -> (BehaviorVm, Arc<Mutex<Vec<CoreMessage>>>, tokio::sync::mpsc::UnboundedReceiver<Message<ScopeEvent>>) {
        let posted = Arc::new(Mutex::new(Vec::new()));
        let sink = posted.clone();
        let poster: Poster = Arc::new(move |m| sink.lock().unwrap().push(m));
        let (channel, rx) = ScopeChannel::new();
        (BehaviorVm::new("agent.1", "scope", CancellationToken::new(), max, poster, channel), posted, rx)
    }

    #[tokio::test]
    async fn test_run_emits_and_posts_state() {
        let (mut vm, posted, mut rx) = vm(2);
        let behavior = Behavior::new("greet")
            .then(Statement::Set { key: "who".into(), value: serde_json::json!("alice") })
            .then(Statement::SetAgentState { key: "greeted".into(), value: serde_json::json!(true) })
            .then(Statement::Emit { text: "hello {who}".into() });
        vm.run(behavior, Parameters::new());

        let event = rx.recv().await.unwrap();
        assert!(matches!(event.payload(), ScopeEvent::BehaviorOutput { text, .. } if text == "hello alice"));
        vm.stop().await;
        assert!(matches!(&posted.lock().unwrap()[0], CoreMessage::SetState { key, .. } if key == "greeted"));
    }

    #[tokio::test]
    async fn test_stop_cancels_sleeping_runs() {
        let (mut vm, posted, _rx) = vm(4);
        let behavior = Behavior::new("slow")
            .then(Statement::Sleep { millis: 60_000 })
            .then(Statement::SetAgentState { key: "late".into(), value: serde_json::json!(1) });
        vm.run(behavior.clone(), Parameters::new());
        vm.run(behavior, Parameters::new());
        assert_eq!(vm.active_runs(), 2);

        let started = std::time::Instant::now();
        vm.stop().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(posted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_reported_to_channel() {
        let (mut vm, _posted, mut rx) = vm(1);
        vm.run(Behavior::new("broken").then(Statement::Fail { reason: "nope".into() }), Parameters::new());
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.payload(), ScopeEvent::Error { message, .. } if message.contains("nope")));
        vm.stop().await;
    }
}
