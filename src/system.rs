//! Agent 系统：根 Agent 的创建与整体关闭
//!
//! 系统持有根监管者；认证产生的 User Agent 都是它的子节点，`shutdown` 级联停止整棵树。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use crate::actors::agent::{spawn_agent, AgentHandle, AgentSettings};
use crate::actors::{Agent, AgentRef, Identity, ScopeChannel, UserAgent, UserMessage, UserScope};
use crate::config::{load_config, AppConfig};
use crate::core::{ShutdownManager, Supervisor};
use crate::services::Services;

pub struct AgentSystem {
    settings: Arc<AgentSettings>,
    services: Services,
    roots: Mutex<Supervisor>,
}

impl AgentSystem {
    pub fn new(config: &AppConfig, services: Services) -> Self {
        Self {
            settings: Arc::new(AgentSettings::from_config(config)),
            services,
            roots: Mutex::new(Supervisor::new()),
        }
    }

    /// 从配置文件与环境变量创建
    pub fn from_config(config_path: Option<PathBuf>, services: Services) -> Result<Self, config::ConfigError> {
        let config = load_config(config_path)?;
        Ok(Self::new(&config, services))
    }

    /// 契约违规时通过 manager 触发 FatalError 关闭
    pub fn with_shutdown(mut self, manager: ShutdownManager) -> Self {
        Arc::make_mut(&mut self.settings).shutdown = Some(manager);
        self
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// 为已认证用户创建根 User Agent；失败时返回空引用
    pub async fn authenticate(&self, identity: Identity, channel: ScopeChannel) -> AgentRef<UserMessage> {
        let username = identity.username.clone();
        let scope = UserScope::new(identity, channel, self.services.clone());
        match self.spawn(UserAgent::new(scope)).await {
            Some(handle) => {
                info!(user = %username, agent = %handle.reference(), "user authenticated");
                handle.reference().clone()
            }
            None => AgentRef::empty(),
        }
    }

    pub async fn spawn<A: Agent>(&self, agent: A) -> Option<AgentHandle<A::Message>> {
        let timeout = self.settings.spawn_timeout();
        self.spawn_with_timeout(agent, timeout).await
    }

    /// 创建根 Agent；超时或初始化失败返回 None
    pub async fn spawn_with_timeout<A: Agent>(&self, agent: A, timeout: Duration) -> Option<AgentHandle<A::Message>> {
        let token = self.roots.lock().await.child_token();
        let spawned = spawn_agent(agent, token, self.settings.clone(), timeout).await?;
        self.roots.lock().await.adopt(
            spawned.reference.address(),
            spawned.token.clone(),
            spawned.lifecycle.clone(),
        );
        Some(spawned.into_handle())
    }

    pub async fn root_count(&self) -> usize {
        self.roots.lock().await.child_count()
    }

    /// 停止所有根 Agent 并等待完成；之后的 spawn 会立即失败
    pub async fn shutdown(&self) {
        let timeout = self.settings.stop_timeout();
        let mut roots = self.roots.lock().await;
        roots.cancel();
        roots.stop_children(timeout).await;
        info!("agent system stopped");
    }
}
