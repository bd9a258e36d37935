//! Agent 层级集成测试：User → Session → Context，mailbox 语义与观测流程

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use twinrt::actors::{
        Ack, Agent, AgentContext, AgentMessage, AgentRef, ContextMessage, ContextScope, CoreMessage, CreateContext,
        CreateSession, Identity, Message, MessageKind, Observe, ObservationStatus, ObserveOutcome, Response, Scope,
        ScopeChannel, ScopeEvent, SessionMessage, UserMessage, UserScope,
    };
    use twinrt::behavior::{Behavior, Statement};
    use twinrt::config::AppConfig;
    use twinrt::core::{AgentError, ServiceError, ShutdownManager, ShutdownReason};
    use twinrt::services::local::ExecutorFactory;
    use twinrt::services::{Actuator, Dataflow, LocalBehaviorLibrary, LocalRuntime, RuntimeService, Services};
    use twinrt::twin::{
        DigitalTwin, Event, Executor, Geometry, Observation, Resolution, TimeExtent, TimeInstant, TwinScope, TwinSummary,
    };
    use twinrt::AgentSystem;

    const DAY: i64 = 86_400_000;
    const ASK: Duration = Duration::from_secs(2);

    type Events = UnboundedReceiver<Message<ScopeEvent>>;

    /// 等待第一个满足条件的通知
    async fn wait_for(events: &mut Events, predicate: impl Fn(&ScopeEvent) -> bool) -> Option<Message<ScopeEvent>> {
        tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(event) = events.recv().await {
                if predicate(event.payload()) {
                    return Some(event);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    fn ten_days() -> Geometry {
        let start = TimeInstant::from_millis(1_704_067_200_000);
        Geometry::with_time(TimeExtent::grid(start, start.plus_millis(10 * DAY), Resolution::days(1)))
    }

    async fn open_context(
        system: &AgentSystem,
        username: &str,
        geometry: Option<Geometry>,
    ) -> (AgentRef<UserMessage>, AgentRef<ContextMessage>, Events) {
        let (channel, events) = ScopeChannel::new();
        let user = system.authenticate(Identity::new(username), channel).await;
        assert!(!user.is_empty());

        let mut create = CreateSession::new(format!("{}-1", username));
        if let Some(geometry) = geometry {
            create = create.with_geometry(geometry);
        }
        let session: AgentRef<SessionMessage> = user.ask(UserMessage::CreateSession(create), ASK).await.unwrap();
        assert!(!session.is_empty());

        let context: AgentRef<ContextMessage> = session
            .ask(SessionMessage::CreateContext(CreateContext::new("valley")), ASK)
            .await
            .unwrap();
        assert!(!context.is_empty());
        (user, context, events)
    }

    // ---- 测试用 Agent ----

    #[derive(Debug)]
    enum ScriptedMessage {
        Core(CoreMessage),
        Record(u32),
        Flush,
        /// 以给定超时创建一个初始化很慢的子 Agent
        SpawnSlow(Duration),
    }

    impl MessageKind for ScriptedMessage {
        fn tag(&self) -> &'static str {
            match self {
                ScriptedMessage::Core(core) => core.tag(),
                ScriptedMessage::Record(_) => "Record",
                ScriptedMessage::Flush => "Flush",
                ScriptedMessage::SpawnSlow(_) => "SpawnSlow",
            }
        }
    }

    impl From<CoreMessage> for ScriptedMessage {
        fn from(core: CoreMessage) -> Self {
            ScriptedMessage::Core(core)
        }
    }

    impl AgentMessage for ScriptedMessage {
        fn into_core(self) -> Result<CoreMessage, Self> {
            match self {
                ScriptedMessage::Core(core) => Ok(core),
                other => Err(other),
            }
        }
    }

    struct ScriptedAgent {
        scope: UserScope,
        seen: Arc<Mutex<Vec<u32>>>,
        stops: Arc<AtomicUsize>,
        init_delay: Duration,
        use_scratch: bool,
        scratch: Arc<Mutex<Option<PathBuf>>>,
        spawned: Arc<Mutex<Option<(bool, usize)>>>,
    }

    impl ScriptedAgent {
        fn new() -> Self {
            Self {
                scope: UserScope::new(Identity::new("scripted"), ScopeChannel::detached(), Services::local()),
                seen: Arc::new(Mutex::new(Vec::new())),
                stops: Arc::new(AtomicUsize::new(0)),
                init_delay: Duration::ZERO,
                use_scratch: false,
                scratch: Arc::new(Mutex::new(None)),
                spawned: Arc::new(Mutex::new(None)),
            }
        }
    }

    #[async_trait]
    impl Agent for ScriptedAgent {
        type Message = ScriptedMessage;

        fn base_name(&self) -> &str {
            "scripted"
        }

        fn scope(&self) -> &dyn Scope {
            &self.scope
        }

        async fn initialize(&mut self, ctx: &mut AgentContext<ScriptedMessage>) -> Result<(), AgentError> {
            if !self.init_delay.is_zero() {
                tokio::time::sleep(self.init_delay).await;
            }
            if self.use_scratch {
                let path = ctx.scratch_path()?.to_path_buf();
                std::fs::write(path.join("state.json"), b"{}")?;
                *self.scratch.lock().unwrap() = Some(path);
            }
            Ok(())
        }

        async fn handle_message(
            &mut self,
            ctx: &mut AgentContext<ScriptedMessage>,
            message: Message<ScriptedMessage>,
        ) -> Result<(), AgentError> {
            match message.into_payload() {
                ScriptedMessage::Record(n) => self.seen.lock().unwrap().push(n),
                ScriptedMessage::Flush => {
                    ctx.reply(Response::Ack);
                }
                ScriptedMessage::SpawnSlow(timeout) => {
                    let mut child = ScriptedAgent::new();
                    child.init_delay = Duration::from_secs(5);
                    let child = ctx.spawn_with_timeout(child, timeout).await;
                    *self.spawned.lock().unwrap() = Some((child.is_empty(), ctx.children()));
                    ctx.reply(Response::Ack);
                }
                ScriptedMessage::Core(core) => return Err(AgentError::UnexpectedMessage(core.tag())),
            }
            Ok(())
        }

        async fn stop(&mut self, _ctx: &mut AgentContext<ScriptedMessage>) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// 统计 WARN 级别日志
    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarnCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// 被释放时计数的执行器
    struct CountedExecutor {
        dropped: Arc<AtomicUsize>,
    }

    impl Executor for CountedExecutor {
        fn execute(&self, _geometry: &Geometry, _event: &Event, _scope: &dyn TwinScope) -> bool {
            true
        }
    }

    impl Drop for CountedExecutor {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// 提交根观测后把它交给调度器两次
    struct DoubleSubmitRuntime;

    #[async_trait]
    impl RuntimeService for DoubleSubmitRuntime {
        async fn run(&self, dataflow: &Dataflow, twin: &mut DigitalTwin, _scope: &ContextScope) -> Result<Observation, ServiceError> {
            let actuator = dataflow
                .actuators
                .first()
                .ok_or_else(|| ServiceError::RuntimeFailed("empty dataflow".into()))?;
            let observation = Observation::new(actuator.observable.clone(), dataflow.geometry.clone());
            let root = twin
                .commit(observation, None)
                .map_err(|e| ServiceError::RuntimeFailed(e.to_string()))?;
            let activity = twin.record_activity("submit twice");
            for _ in 0..2 {
                twin.submit(&root, &activity)
                    .map_err(|e| ServiceError::RuntimeFailed(e.to_string()))?;
            }
            Ok(root)
        }
    }

    // ---- 层级与观测 ----

    #[tokio::test]
    async fn test_user_session_context_observe_populates_twin() {
        let system = AgentSystem::new(&AppConfig::default(), Services::local());
        let (_user, context, mut events) = open_context(&system, "alice", Some(ten_days())).await;

        let fresh: TwinSummary = context.ask(ContextMessage::DescribeTwin, ASK).await.unwrap();
        assert!(fresh.is_empty());
        assert!(!fresh.disposed);

        let outcome: ObserveOutcome = context
            .ask(ContextMessage::Observe(Observe::new("earth:Temperature")), ASK)
            .await
            .unwrap();
        assert_eq!(outcome.status, ObservationStatus::Finished);
        assert!(outcome.observation.is_some());

        let started = wait_for(&mut events, |e| {
            matches!(e, ScopeEvent::Status { status: ObservationStatus::Started, urn, .. } if urn == "earth:Temperature")
        })
        .await
        .unwrap();
        let finished = wait_for(&mut events, |e| {
            matches!(e, ScopeEvent::Status { status: ObservationStatus::Finished, urn, .. } if urn == "earth:Temperature")
        })
        .await
        .unwrap();
        assert_eq!(started.in_response_to(), finished.in_response_to());
        assert!(started.in_response_to().value() > 0);

        let summary: TwinSummary = context.ask(ContextMessage::DescribeTwin, ASK).await.unwrap();
        assert!(!summary.is_empty());
        assert_eq!(summary.resolution, Some(Resolution::days(1)));
        assert_eq!(summary.epoch_start, Some(TimeInstant::from_millis(1_704_067_200_000)));

        system.shutdown().await;
    }

    #[tokio::test]
    async fn test_quality_over_time_requests_change_observation() {
        let system = AgentSystem::new(&AppConfig::default(), Services::local());
        let (_user, context, mut events) = open_context(&system, "bob", Some(ten_days())).await;

        let _: ObserveOutcome = context
            .ask(ContextMessage::Observe(Observe::new("earth:Temperature")), ASK)
            .await
            .unwrap();

        let requested = wait_for(&mut events, |e| matches!(e, ScopeEvent::ObservationRequested { .. }))
            .await
            .unwrap();
        match requested.payload() {
            ScopeEvent::ObservationRequested { urn, derivation_depth, .. } => {
                assert_eq!(urn, "change in earth:Temperature");
                assert_eq!(*derivation_depth, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let derived = wait_for(&mut events, |e| {
            matches!(e, ScopeEvent::Status { status: ObservationStatus::Finished, urn, .. } if urn == "change in earth:Temperature")
        })
        .await;
        assert!(derived.is_some());

        // 派生观测不会再派生
        let summary: TwinSummary = context.ask(ContextMessage::DescribeTwin, ASK).await.unwrap();
        assert_eq!(summary.observations, 2);

        system.shutdown().await;
    }

    #[tokio::test]
    async fn test_unresolvable_urn_is_aborted() {
        let system = AgentSystem::new(&AppConfig::default(), Services::local());
        let (_user, context, mut events) = open_context(&system, "carol", None).await;

        let outcome: ObserveOutcome = context
            .ask(ContextMessage::Observe(Observe::new("https://example.org/sensor")), ASK)
            .await
            .unwrap();
        assert_eq!(outcome.status, ObservationStatus::Aborted);
        assert_eq!(outcome.error.as_deref(), Some("Cannot resolve URN https://example.org/sensor"));

        let error = wait_for(&mut events, |e| matches!(e, ScopeEvent::Error { .. })).await;
        assert!(error.is_some());

        let summary: TwinSummary = context.ask(ContextMessage::DescribeTwin, ASK).await.unwrap();
        assert!(summary.is_empty());

        system.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_asks_get_their_own_replies() {
        let system = AgentSystem::new(&AppConfig::default(), Services::local());
        let (_user, context, _events) = open_context(&system, "dave", Some(ten_days())).await;

        let (a, b, c) = tokio::join!(
            context.ask::<ObserveOutcome>(ContextMessage::Observe(Observe::new("earth:Temperature")), ASK),
            context.ask::<ObserveOutcome>(ContextMessage::Observe(Observe::new("earth:Pressure")), ASK),
            context.ask::<ObserveOutcome>(ContextMessage::Observe(Observe::new("urn:a:b:c:d")), ASK),
        );
        assert_eq!(a.unwrap().urn, "earth:Temperature");
        assert_eq!(b.unwrap().urn, "earth:Pressure");
        let c = c.unwrap();
        assert_eq!(c.urn, "urn:a:b:c:d");
        assert_eq!(c.status, ObservationStatus::Aborted);

        system.shutdown().await;
    }

    #[tokio::test]
    async fn test_advance_time_moves_twin_clock() {
        let system = AgentSystem::new(&AppConfig::default(), Services::local());
        let (_user, context, _events) = open_context(&system, "erin", Some(ten_days())).await;

        let _: ObserveOutcome = context
            .ask(ContextMessage::Observe(Observe::new("earth:Temperature")), ASK)
            .await
            .unwrap();
        let later = TimeInstant::from_millis(1_704_067_200_000 + 3 * DAY);
        let ack: Option<Ack> = context.ask(ContextMessage::AdvanceTime(later), ASK).await;
        assert!(ack.is_some());

        let summary: TwinSummary = context.ask(ContextMessage::DescribeTwin, ASK).await.unwrap();
        assert_eq!(summary.current_time, Some(later));

        system.shutdown().await;
    }

    // ---- 基础消息与行为 ----

    #[tokio::test]
    async fn test_set_state_is_acknowledged() {
        let system = AgentSystem::new(&AppConfig::default(), Services::local());
        let (user, _context, _events) = open_context(&system, "frank", None).await;

        let ack: Option<Ack> = user
            .ask(
                UserMessage::Core(CoreMessage::SetState {
                    key: "mode".into(),
                    value: json!("batch"),
                }),
                ASK,
            )
            .await;
        assert!(ack.is_some());

        system.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_behavior_reports_scope_error() {
        let system = AgentSystem::new(&AppConfig::default(), Services::local());
        let (channel, mut events) = ScopeChannel::new();
        let user = system.authenticate(Identity::new("grace"), channel).await;

        user.tell(UserMessage::Core(CoreMessage::RunBehavior {
            behavior: "missing".into(),
        }));

        let error = wait_for(&mut events, |e| matches!(e, ScopeEvent::Error { .. })).await.unwrap();
        match error.payload() {
            ScopeEvent::Error { message, .. } => assert!(message.contains("behavior missing cannot be found")),
            other => panic!("unexpected event {:?}", other),
        }
        // Agent 继续处理后续消息
        let ack: Option<Ack> = user
            .ask(
                UserMessage::Core(CoreMessage::SetState {
                    key: "k".into(),
                    value: json!(1),
                }),
                ASK,
            )
            .await;
        assert!(ack.is_some());

        system.shutdown().await;
    }

    #[tokio::test]
    async fn test_known_behavior_runs_in_agent() {
        let library = LocalBehaviorLibrary::new().with_behavior(
            Behavior::new("greet")
                .then(Statement::Set {
                    key: "who".into(),
                    value: json!("world"),
                })
                .then(Statement::Emit { text: "hello".into() }),
        );
        let services = Services::local().with_behaviors(Arc::new(library));
        let system = AgentSystem::new(&AppConfig::default(), services);
        let (channel, mut events) = ScopeChannel::new();
        let user = system.authenticate(Identity::new("heidi"), channel).await;

        user.tell(UserMessage::Core(CoreMessage::RunBehavior {
            behavior: "greet".into(),
        }));

        let output = wait_for(&mut events, |e| matches!(e, ScopeEvent::BehaviorOutput { .. })).await.unwrap();
        match output.payload() {
            ScopeEvent::BehaviorOutput { text, behavior, .. } => {
                assert_eq!(text, "hello");
                assert_eq!(behavior, "greet");
            }
            other => panic!("unexpected event {:?}", other),
        }

        system.shutdown().await;
    }

    // ---- mailbox 语义 ----

    #[tokio::test]
    async fn test_mailbox_processes_in_arrival_order() {
        let system = AgentSystem::new(&AppConfig::default(), Services::local());
        let agent = ScriptedAgent::new();
        let seen = agent.seen.clone();
        let handle = system.spawn(agent).await.unwrap();

        for n in 0..100 {
            handle.reference().tell(ScriptedMessage::Record(n));
        }
        let flushed: Option<Ack> = handle.reference().ask(ScriptedMessage::Flush, ASK).await;
        assert!(flushed.is_some());
        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_spawn_times_out_on_slow_initialization() {
        let system = AgentSystem::new(&AppConfig::default(), Services::local());
        let mut agent = ScriptedAgent::new();
        agent.init_delay = Duration::from_secs(5);

        let started = Instant::now();
        let handle = system.spawn_with_timeout(agent, Duration::from_millis(100)).await;
        let elapsed = started.elapsed();

        assert!(handle.is_none());
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(1));
        assert_eq!(system.root_count().await, 0);
    }

    #[tokio::test]
    async fn test_child_spawn_times_out_with_empty_ref() {
        let system = AgentSystem::new(&AppConfig::default(), Services::local());
        let agent = ScriptedAgent::new();
        let spawned = agent.spawned.clone();
        let handle = system.spawn(agent).await.unwrap();

        let started = Instant::now();
        let ack: Option<Ack> = handle
            .reference()
            .ask(ScriptedMessage::SpawnSlow(Duration::from_millis(100)), ASK)
            .await;
        let elapsed = started.elapsed();

        assert!(ack.is_some());
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(1));
        // 空引用，且超时的子 Agent 没有被收养
        assert_eq!(*spawned.lock().unwrap(), Some((true, 0)));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_scratch_is_released_once_on_stop() {
        let warnings = Arc::new(AtomicUsize::new(0));
        let _guard = tracing_subscriber::registry()
            .with(WarnCounter(warnings.clone()))
            .set_default();
        let root = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.agents.scratch_root = Some(root.path().to_path_buf());
        let system = AgentSystem::new(&config, Services::local());

        let mut agent = ScriptedAgent::new();
        agent.use_scratch = true;
        let scratch = agent.scratch.clone();
        let stops = agent.stops.clone();
        let handle = system.spawn(agent).await.unwrap();

        let path = scratch.lock().unwrap().clone().unwrap();
        assert!(path.starts_with(root.path()));
        assert!(path.join("state.json").exists());

        handle.stop().await;
        handle.stop().await;
        system.shutdown().await;

        assert!(!path.exists());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(warnings.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_context_stop_disposes_twin_executors() {
        let created = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));
        let factory: ExecutorFactory = {
            let created = created.clone();
            let dropped = dropped.clone();
            Arc::new(move |_: &Actuator| {
                created.fetch_add(1, Ordering::SeqCst);
                Arc::new(CountedExecutor {
                    dropped: dropped.clone(),
                }) as Arc<dyn Executor>
            })
        };
        let services = Services::local().with_runtime(Arc::new(LocalRuntime::with_executors(factory)));
        let system = AgentSystem::new(&AppConfig::default(), services);
        let (_user, context, _events) = open_context(&system, "kim", Some(ten_days())).await;

        let outcome: ObserveOutcome = context
            .ask(ContextMessage::Observe(Observe::new("earth:Temperature")), ASK)
            .await
            .unwrap();
        assert!(outcome.is_finished());
        assert!(created.load(Ordering::SeqCst) > 0);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        system.shutdown().await;

        assert!(!context.is_alive());
        assert_eq!(dropped.load(Ordering::SeqCst), created.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_double_submit_stops_context_and_requests_shutdown() {
        let manager = ShutdownManager::new();
        let mut reasons = manager.subscribe();
        let services = Services::local().with_runtime(Arc::new(DoubleSubmitRuntime));
        let system = AgentSystem::new(&AppConfig::default(), services).with_shutdown(manager.clone());
        let (user, context, mut events) = open_context(&system, "judy", Some(ten_days())).await;

        let outcome: Option<ObserveOutcome> = context
            .ask(ContextMessage::Observe(Observe::new("earth:Temperature")), ASK)
            .await;
        assert!(outcome.is_none(), "violation must not become an Aborted reply");

        let reason = tokio::time::timeout(ASK, reasons.recv()).await.unwrap().unwrap();
        match reason {
            ShutdownReason::FatalError(message) => assert!(message.contains("submitted twice"), "{message}"),
            other => panic!("unexpected shutdown reason {:?}", other),
        }
        assert!(manager.is_shutdown());

        let error = wait_for(&mut events, |e| {
            matches!(e, ScopeEvent::Error { message, .. } if message.contains("submitted twice"))
        })
        .await;
        assert!(error.is_some());
        tokio::time::timeout(ASK, context.stopped()).await.unwrap();
        assert!(!context.is_alive());
        assert!(user.is_alive());

        system.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let system = AgentSystem::new(&AppConfig::default(), Services::local());
        let agent = ScriptedAgent::new();
        let stops = agent.stops.clone();
        let handle = system.spawn(agent).await.unwrap();
        assert!(handle.reference().is_alive());

        handle.stop().await;
        handle.stop().await;

        assert!(handle.is_stopped());
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        // 停止后的 ask 不会挂起
        let reply: Option<Ack> = handle.reference().ask(ScriptedMessage::Flush, Duration::from_millis(200)).await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_whole_tree() {
        let system = AgentSystem::new(&AppConfig::default(), Services::local());
        let (user, context, _events) = open_context(&system, "ivan", None).await;
        assert_eq!(system.root_count().await, 1);

        system.shutdown().await;

        assert!(!user.is_alive());
        assert!(!context.is_alive());
        let reply: Option<TwinSummary> = context.ask(ContextMessage::DescribeTwin, Duration::from_millis(200)).await;
        assert!(reply.is_none());
    }
}
