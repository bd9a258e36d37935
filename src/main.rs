//! Twinrt 入口：加载配置、初始化日志，运行一个演示会话
//!
//! 认证用户 → 创建会话与上下文 → 观测一个按日变化的质量 → 推进时间 → 输出孪生概要；
//! 结束或收到 Ctrl+C 后停止整棵 Agent 树。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use twinrt::actors::{
    Ack, AgentRef, ContextMessage, CreateContext, CreateSession, Identity, Observe, ObserveOutcome, ScopeChannel,
    SessionMessage, UserMessage,
};
use twinrt::config::load_config;
use twinrt::core::shutdown::run_with_graceful_shutdown;
use twinrt::core::{AgentTreeCleanup, ShutdownCoordinator, ShutdownManager};
use twinrt::services::Services;
use twinrt::twin::{Geometry, Resolution, TimeExtent, TimeInstant, TwinSummary};
use twinrt::AgentSystem;

const DAY: i64 = 86_400_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config(std::env::args().nth(1).map(PathBuf::from)).context("Failed to load config")?;
    twinrt::observability::init(&config.logging.filter);

    let shutdown = Arc::new(ShutdownManager::new());
    let system = Arc::new(AgentSystem::new(&config, Services::local()).with_shutdown(shutdown.as_ref().clone()));
    let mut coordinator = ShutdownCoordinator::new(shutdown.clone()).with_timeout(config.agents.stop_timeout() * 2);
    coordinator.register(AgentTreeCleanup::new(system.clone()));

    // 客户端通知：以 JSON 打印
    let (channel, mut events) = ScopeChannel::new();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Ok(json) = serde_json::to_string(event.payload()) {
                info!(target: "twinrt::events", in_response_to = %event.in_response_to(), "{}", json);
            }
        }
    });

    let timeout = system.settings().ask_timeout();
    let app = async {
        if let Err(e) = demo(&system, channel, timeout).await {
            tracing::error!("Demo failed: {:#}", e);
        }
    };
    run_with_graceful_shutdown(shutdown, app, &coordinator).await;

    Ok(())
}

async fn demo(system: &AgentSystem, channel: ScopeChannel, timeout: Duration) -> anyhow::Result<()> {
    let user = system.authenticate(Identity::new("demo"), channel).await;
    anyhow::ensure!(!user.is_empty(), "user agent could not be created");

    // 2024-01-01T00:00:00Z 起的 10 天，按日
    let start = TimeInstant::from_millis(1_704_067_200_000);
    let geometry = Geometry::with_time(TimeExtent::grid(start, start.plus_millis(10 * DAY), Resolution::days(1)));

    let session: AgentRef<SessionMessage> = user
        .ask(
            UserMessage::CreateSession(CreateSession::new("demo-1").with_geometry(geometry)),
            timeout,
        )
        .await
        .context("No reply to CreateSession")?;
    anyhow::ensure!(!session.is_empty(), "session agent could not be created");

    let context: AgentRef<ContextMessage> = session
        .ask(SessionMessage::CreateContext(CreateContext::new("valley")), timeout)
        .await
        .context("No reply to CreateContext")?;
    anyhow::ensure!(!context.is_empty(), "context agent could not be created");

    let outcome: ObserveOutcome = context
        .ask(ContextMessage::Observe(Observe::new("earth:Temperature")), timeout)
        .await
        .context("No reply to Observe")?;
    info!(urn = %outcome.urn, status = ?outcome.status, "observation resolved");

    let _: Option<Ack> = context
        .ask(ContextMessage::AdvanceTime(start.plus_millis(5 * DAY)), timeout)
        .await;

    let summary: TwinSummary = context
        .ask(ContextMessage::DescribeTwin, timeout)
        .await
        .context("No reply to DescribeTwin")?;
    info!("Digital twin:\n{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
