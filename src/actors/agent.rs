//! Agent 基础运行时：mailbox 循环、spawn、基础消息、行为引擎与 scratch 资源
//!
//! 每个 Agent 一个 tokio 任务，按到达顺序逐条处理消息，处理器之间不会交错。
//! 处理器返回错误或 panic 时上报到 scope.error，Agent 继续处理后续消息；
//! 以 ContractViolation 为载荷的 panic 不可恢复：Agent 停止，并按 FatalError 触发系统关闭。
//! 停止由取消令牌触发，只执行一次：停行为引擎 → 删除 scratch → 停子 Agent → stopped。

use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::agent_ref::{AgentRef, Envelope};
use super::message::{AgentMessage, CoreMessage, Message, MessageId, MessageKind, Response};
use super::scope::{Parameters, Scope};
use crate::behavior::{Behavior, BehaviorVm};
use crate::config::{AgentsSection, AppConfig, SchedulerSection};
use crate::core::state::advance;
use crate::core::{AgentError, ContractViolation, Lifecycle, ShutdownManager, ShutdownReason, Supervisor};

/// Agent 运行参数（来自配置的 [agents] 与 [scheduler] 段）
#[derive(Debug, Clone, Default)]
pub struct AgentSettings {
    pub agents: AgentsSection,
    pub scheduler: SchedulerSection,
    /// 契约违规时触发关闭；未设置时只停止出错的 Agent
    pub shutdown: Option<ShutdownManager>,
}

impl AgentSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            agents: config.agents.clone(),
            scheduler: config.scheduler.clone(),
            shutdown: None,
        }
    }

    pub fn ask_timeout(&self) -> Duration {
        self.agents.ask_timeout()
    }

    pub fn spawn_timeout(&self) -> Duration {
        self.agents.spawn_timeout()
    }

    pub fn stop_timeout(&self) -> Duration {
        self.agents.stop_timeout()
    }
}

#[async_trait]
pub trait Agent: Send + 'static {
    type Message: AgentMessage;

    /// 名称前缀；实际名称为 `<base>.<short-uuid>`
    fn base_name(&self) -> &str;

    fn scope(&self) -> &dyn Scope;

    async fn initialize(&mut self, _ctx: &mut AgentContext<Self::Message>) -> Result<(), AgentError> {
        Ok(())
    }

    /// 处理一条非基础消息。不要在这里 ask 自己：mailbox 串行，会一直等到超时
    async fn handle_message(
        &mut self,
        ctx: &mut AgentContext<Self::Message>,
        message: Message<Self::Message>,
    ) -> Result<(), AgentError>;

    async fn stop(&mut self, _ctx: &mut AgentContext<Self::Message>) {}
}

/// 处理器可用的 Agent 运行时上下文
pub struct AgentContext<M: AgentMessage> {
    name: String,
    self_ref: AgentRef<M>,
    state: Parameters,
    vm: Option<BehaviorVm>,
    scratch: Option<PathBuf>,
    supervisor: Supervisor,
    settings: Arc<AgentSettings>,
    pending_reply: Option<(MessageId, oneshot::Sender<Message<Response>>)>,
}

impl<M: AgentMessage> AgentContext<M> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn self_ref(&self) -> &AgentRef<M> {
        &self.self_ref
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn state(&self) -> &Parameters {
        &self.state
    }

    pub fn get_state(&self, key: &str) -> Option<&serde_json::Value> {
        self.state.get(key)
    }

    pub fn set_state(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.state.insert(key.into(), value);
    }

    /// 当前消息是否由 ask 发来且尚未回复
    pub fn has_pending_reply(&self) -> bool {
        self.pending_reply.is_some()
    }

    /// 回复当前 ask；每条请求最多回复一次，返回是否送达
    pub fn reply(&mut self, response: Response) -> bool {
        let Some((request, reply)) = self.pending_reply.take() else {
            debug!(agent = %self.name, tag = response.tag(), "no pending ask, reply dropped");
            return false;
        };
        reply.send(Message::response_to(request, response)).is_ok()
    }

    /// 创建子 Agent，在 spawn 超时内等待其初始化完成
    pub async fn spawn<A>(&mut self, agent: A) -> AgentRef<A::Message>
    where
        A: Agent,
    {
        let timeout = self.settings.spawn_timeout();
        self.spawn_with_timeout(agent, timeout).await
    }

    pub async fn spawn_with_timeout<A>(&mut self, agent: A, timeout: Duration) -> AgentRef<A::Message>
    where
        A: Agent,
    {
        match spawn_agent(agent, self.supervisor.child_token(), self.settings.clone(), timeout).await {
            Some(spawned) => {
                self.supervisor
                    .adopt(spawned.reference.address(), spawned.token, spawned.lifecycle);
                spawned.reference
            }
            None => AgentRef::empty(),
        }
    }

    pub fn children(&self) -> usize {
        self.supervisor.child_count()
    }

    /// 在行为引擎中异步运行；引擎首次使用时创建
    pub fn run_behavior(&mut self, behavior: Behavior, scope: &dyn Scope) {
        if self.vm.is_none() {
            let me = self.self_ref.clone();
            self.vm = Some(BehaviorVm::new(
                &self.name,
                scope.name(),
                self.supervisor.child_token(),
                self.settings.agents.max_concurrent_behaviors,
                Arc::new(move |core: CoreMessage| me.tell(M::from(core))),
                scope.channel().clone(),
            ));
        }
        let mut inputs = scope.data().clone();
        inputs.extend(self.state.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(vm) = &mut self.vm {
            vm.run(behavior, inputs);
        }
    }

    /// Agent 专属的临时目录，首次使用时创建，停止时删除
    pub fn scratch_path(&mut self) -> Result<&Path, AgentError> {
        if self.scratch.is_none() {
            let path = self.settings.agents.scratch_root().join(&self.name);
            std::fs::create_dir_all(&path)?;
            debug!(agent = %self.name, path = %path.display(), "scratch created");
            self.scratch = Some(path);
        }
        self.scratch
            .as_deref()
            .ok_or_else(|| AgentError::HandlerFailed("scratch unavailable".into()))
    }

    /// 停止时释放资源；take 保证每项只释放一次
    async fn release(&mut self) {
        if let Some(vm) = self.vm.take() {
            vm.stop().await;
        }
        if let Some(path) = self.scratch.take() {
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!(agent = %self.name, path = %path.display(), error = %e, "failed to remove scratch");
            }
        }
        let timeout = self.settings.stop_timeout();
        self.supervisor.stop_children(timeout).await;
    }
}

/// 所有者持有的句柄：可停止 Agent；引用（AgentRef）不具备这个能力
pub struct AgentHandle<M> {
    reference: AgentRef<M>,
    token: CancellationToken,
}

impl<M: MessageKind> AgentHandle<M> {
    pub fn reference(&self) -> &AgentRef<M> {
        &self.reference
    }

    /// 停止 Agent 及其整棵子树并等待完成；可重复调用
    pub async fn stop(&self) {
        self.token.cancel();
        self.reference.stopped().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.reference.lifecycle().is_terminal()
    }
}

pub(crate) struct Spawned<M> {
    pub(crate) reference: AgentRef<M>,
    pub(crate) token: CancellationToken,
    pub(crate) lifecycle: watch::Receiver<Lifecycle>,
}

impl<M: MessageKind> Spawned<M> {
    pub(crate) fn into_handle(self) -> AgentHandle<M> {
        AgentHandle {
            reference: self.reference,
            token: self.token,
        }
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// 启动 Agent 任务并等待初始化确认；超时或初始化失败时取消并返回 None
pub(crate) async fn spawn_agent<A: Agent>(
    agent: A,
    token: CancellationToken,
    settings: Arc<AgentSettings>,
    timeout: Duration,
) -> Option<Spawned<A::Message>> {
    let name = format!("{}.{}", agent.base_name(), short_id());
    let (tx, rx) = mpsc::unbounded_channel();
    let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle::Created);
    let reference = AgentRef::new(name.as_str(), tx, lifecycle_rx.clone());
    let (ready_tx, ready_rx) = oneshot::channel();

    let ctx = AgentContext {
        name: name.clone(),
        self_ref: reference.clone(),
        state: Parameters::new(),
        vm: None,
        scratch: None,
        supervisor: Supervisor::with_parent(&token),
        settings,
        pending_reply: None,
    };
    tokio::spawn(run_mailbox(agent, ctx, rx, lifecycle_tx, ready_tx));

    match tokio::time::timeout(timeout, ready_rx).await {
        Ok(Ok(())) => {
            debug!(agent = %name, "agent spawned");
            Some(Spawned {
                reference,
                token,
                lifecycle: lifecycle_rx,
            })
        }
        Ok(Err(_)) => {
            warn!(agent = %name, "agent failed to initialize");
            token.cancel();
            None
        }
        Err(_) => {
            warn!(agent = %name, timeout_ms = timeout.as_millis() as u64, "agent spawn timed out");
            token.cancel();
            None
        }
    }
}

async fn run_mailbox<A: Agent>(
    mut agent: A,
    mut ctx: AgentContext<A::Message>,
    mut rx: mpsc::UnboundedReceiver<Envelope<A::Message>>,
    lifecycle: watch::Sender<Lifecycle>,
    ready: oneshot::Sender<()>,
) {
    let token = ctx.supervisor.cancel_token();
    advance(&lifecycle, Lifecycle::Initializing);

    let initialized = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        result = AssertUnwindSafe(agent.initialize(&mut ctx)).catch_unwind() => Some(result),
    };

    match initialized {
        Some(Ok(Ok(()))) => {
            advance(&lifecycle, Lifecycle::Ready);
            info!(agent = %ctx.name, "agent ready");
            let _ = ready.send(());
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    envelope = rx.recv() => match envelope {
                        Some(envelope) => {
                            if dispatch(&mut agent, &mut ctx, envelope).await.is_break() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        }
        Some(Ok(Err(e))) => {
            agent.scope().error(&format!("{} failed to initialize: {}", ctx.name, e));
        }
        Some(Err(panic)) => {
            agent
                .scope()
                .error(&format!("{} panicked during initialization: {}", ctx.name, panic_message(&panic)));
        }
        None => debug!(agent = %ctx.name, "cancelled during initialization"),
    }

    advance(&lifecycle, Lifecycle::Stopping);
    rx.close();
    if AssertUnwindSafe(agent.stop(&mut ctx)).catch_unwind().await.is_err() {
        error!(agent = %ctx.name, "stop hook panicked");
    }
    ctx.release().await;
    advance(&lifecycle, Lifecycle::Stopped);
    info!(agent = %ctx.name, "agent stopped");
}

async fn dispatch<A: Agent>(
    agent: &mut A,
    ctx: &mut AgentContext<A::Message>,
    envelope: Envelope<A::Message>,
) -> ControlFlow<()> {
    let (message, reply) = envelope.into_parts();
    let tag = message.payload().tag();
    debug!(agent = %ctx.name, tag, id = %message.id(), "dispatching");
    ctx.pending_reply = reply.map(|reply| (message.id(), reply));

    let outcome = match message.into_core() {
        Ok(core) => AssertUnwindSafe(handle_core(agent, ctx, core.into_payload()))
            .catch_unwind()
            .await,
        Err(message) => AssertUnwindSafe(agent.handle_message(ctx, message)).catch_unwind().await,
    };

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(agent = %ctx.name, tag, error = %e, "handler failed");
            agent.scope().error(&format!("{} failed handling {}: {}", ctx.name, tag, e));
        }
        Err(panic) if panic.is::<ContractViolation>() => {
            let message = panic_message(&panic);
            error!(agent = %ctx.name, tag, error = %message, "contract violated, stopping agent");
            agent.scope().error(&format!("{} stopped: {}", ctx.name, message));
            if let Some(shutdown) = &ctx.settings.shutdown {
                shutdown.shutdown(ShutdownReason::FatalError(message));
            }
            ctx.pending_reply = None;
            return ControlFlow::Break(());
        }
        Err(panic) => {
            let e = AgentError::HandlerPanicked(panic_message(&panic));
            error!(agent = %ctx.name, tag, error = %e, "handler panicked");
            agent.scope().error(&format!("{} failed handling {}: {}", ctx.name, tag, e));
        }
    }
    // 未回复的 ask 在这里释放，请求方立即得到 None
    ctx.pending_reply = None;
    ControlFlow::Continue(())
}

async fn handle_core<A: Agent>(agent: &mut A, ctx: &mut AgentContext<A::Message>, core: CoreMessage) -> Result<(), AgentError> {
    match core {
        CoreMessage::SetState { key, value } => {
            debug!(agent = %ctx.name, key = %key, "state updated");
            ctx.set_state(key, value);
            ctx.reply(Response::Ack);
        }
        CoreMessage::RunBehavior { behavior } => {
            let scope = agent.scope();
            match scope.services().behaviors.resolve_behavior(&behavior) {
                Some(resolved) => {
                    info!(agent = %ctx.name, behavior = %behavior, "running behavior");
                    ctx.run_behavior(resolved, scope);
                    ctx.reply(Response::Ack);
                }
                None => {
                    scope.error(&format!("behavior {} cannot be found in scope {}", behavior, scope.name()));
                }
            }
        }
    }
    Ok(())
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(violation) = panic.downcast_ref::<ContractViolation>() {
        violation.to_string()
    } else {
        "unknown panic".to_string()
    }
}
