//! 用户 Agent：认证用户的根 Agent，按请求创建会话 Agent

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::agent::{Agent, AgentContext};
use super::message::{AgentMessage, CoreMessage, Message, MessageKind, Response};
use super::scope::{Scope, UserScope};
use super::session::SessionAgent;
use crate::core::AgentError;
use crate::twin::Geometry;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateSession {
    pub name: String,
    /// 会话默认几何，上下文未指定时继承
    pub geometry: Option<Geometry>,
}

impl CreateSession {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            geometry: None,
        }
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }
}

#[derive(Clone, Debug)]
pub enum UserMessage {
    Core(CoreMessage),
    CreateSession(CreateSession),
}

impl MessageKind for UserMessage {
    fn tag(&self) -> &'static str {
        match self {
            UserMessage::Core(core) => core.tag(),
            UserMessage::CreateSession(_) => "CreateSession",
        }
    }
}

impl From<CoreMessage> for UserMessage {
    fn from(core: CoreMessage) -> Self {
        UserMessage::Core(core)
    }
}

impl AgentMessage for UserMessage {
    fn into_core(self) -> Result<CoreMessage, Self> {
        match self {
            UserMessage::Core(core) => Ok(core),
            other => Err(other),
        }
    }
}

pub struct UserAgent {
    scope: UserScope,
}

impl UserAgent {
    pub fn new(scope: UserScope) -> Self {
        Self { scope }
    }
}

#[async_trait]
impl Agent for UserAgent {
    type Message = UserMessage;

    fn base_name(&self) -> &str {
        &self.scope.identity().username
    }

    fn scope(&self) -> &dyn Scope {
        &self.scope
    }

    async fn handle_message(
        &mut self,
        ctx: &mut AgentContext<UserMessage>,
        message: Message<UserMessage>,
    ) -> Result<(), AgentError> {
        match message.into_payload() {
            UserMessage::CreateSession(request) => {
                let session = SessionAgent::new(self.scope.session(request.name.as_str(), request.geometry));
                let reference = ctx.spawn(session).await;
                if reference.is_empty() {
                    warn!(user = %ctx.name(), session = %request.name, "session could not be created");
                }
                ctx.reply(Response::Session(reference));
                Ok(())
            }
            UserMessage::Core(core) => Err(AgentError::UnexpectedMessage(core.tag())),
        }
    }
}
