//! 会话 Agent：用户会话，按请求创建上下文 Agent

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::agent::{Agent, AgentContext};
use super::context::ContextAgent;
use super::message::{AgentMessage, CoreMessage, Message, MessageKind, Response};
use super::scope::{Scope, SessionScope};
use crate::core::AgentError;
use crate::twin::Geometry;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateContext {
    pub name: Option<String>,
    /// 覆盖会话几何
    pub geometry: Option<Geometry>,
}

impl CreateContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            geometry: None,
        }
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }
}

#[derive(Clone, Debug)]
pub enum SessionMessage {
    Core(CoreMessage),
    CreateContext(CreateContext),
}

impl MessageKind for SessionMessage {
    fn tag(&self) -> &'static str {
        match self {
            SessionMessage::Core(core) => core.tag(),
            SessionMessage::CreateContext(_) => "CreateContext",
        }
    }
}

impl From<CoreMessage> for SessionMessage {
    fn from(core: CoreMessage) -> Self {
        SessionMessage::Core(core)
    }
}

impl AgentMessage for SessionMessage {
    fn into_core(self) -> Result<CoreMessage, Self> {
        match self {
            SessionMessage::Core(core) => Ok(core),
            other => Err(other),
        }
    }
}

pub struct SessionAgent {
    scope: SessionScope,
}

impl SessionAgent {
    pub fn new(scope: SessionScope) -> Self {
        Self { scope }
    }
}

#[async_trait]
impl Agent for SessionAgent {
    type Message = SessionMessage;

    fn base_name(&self) -> &str {
        self.scope.name()
    }

    fn scope(&self) -> &dyn Scope {
        &self.scope
    }

    async fn handle_message(
        &mut self,
        ctx: &mut AgentContext<SessionMessage>,
        message: Message<SessionMessage>,
    ) -> Result<(), AgentError> {
        match message.into_payload() {
            SessionMessage::CreateContext(request) => {
                let name = request.name.unwrap_or_else(|| "context".to_string());
                let context = ContextAgent::new(self.scope.context(name, request.geometry));
                let reference = ctx.spawn(context).await;
                if reference.is_empty() {
                    warn!(session = %ctx.name(), "context could not be created");
                }
                ctx.reply(Response::Context(reference));
                Ok(())
            }
            SessionMessage::Core(core) => Err(AgentError::UnexpectedMessage(core.tag())),
        }
    }
}
