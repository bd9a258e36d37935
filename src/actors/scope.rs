//! Scope：Agent 的外部上下文（身份、几何、服务、通知通道）
//!
//! 层级与 Agent 树一致：UserScope → SessionScope → ContextScope。
//! 状态与错误通过 ScopeChannel 推给客户端；通道关闭时通知静默丢弃。

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::agent_ref::AgentRef;
use super::context::{ContextMessage, Derivation, Observe};
use super::message::{Message, MessageKind};
use crate::services::Services;
use crate::twin::{Geometry, Observation, ObservationRequest, TwinScope};

/// scope 局部数据（行为运行的输入）
pub type Parameters = HashMap<String, serde_json::Value>;

/// 观测请求的状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObservationStatus {
    Empty,
    Started,
    Finished,
    Aborted,
}

/// 推给客户端的通知
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScopeEvent {
    Status {
        scope: String,
        urn: String,
        status: ObservationStatus,
        observation: Option<Observation>,
        error: Option<String>,
    },
    Error {
        scope: String,
        message: String,
    },
    ObservationRequested {
        scope: String,
        urn: String,
        derivation_depth: u32,
    },
    BehaviorOutput {
        scope: String,
        behavior: String,
        text: String,
    },
}

impl MessageKind for ScopeEvent {
    fn tag(&self) -> &'static str {
        match self {
            ScopeEvent::Status { .. } => "Status",
            ScopeEvent::Error { .. } => "Error",
            ScopeEvent::ObservationRequested { .. } => "ObservationRequested",
            ScopeEvent::BehaviorOutput { .. } => "BehaviorOutput",
        }
    }
}

/// 通知通道；detached 通道只记录日志
#[derive(Clone, Debug, Default)]
pub struct ScopeChannel {
    tx: Option<mpsc::UnboundedSender<Message<ScopeEvent>>>,
}

impl ScopeChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message<ScopeEvent>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, message: Message<ScopeEvent>) {
        match &self.tx {
            Some(tx) => {
                if tx.send(message).is_err() {
                    debug!("scope channel closed, notification dropped");
                }
            }
            None => debug!(tag = message.payload().tag(), "notification on detached scope"),
        }
    }
}

/// 所有 scope 的公共能力
pub trait Scope: Send + Sync {
    fn name(&self) -> &str;

    fn channel(&self) -> &ScopeChannel;

    fn services(&self) -> &Services;

    fn data(&self) -> &Parameters;

    fn send(&self, message: Message<ScopeEvent>) {
        self.channel().send(message);
    }

    /// 上报错误：写日志并通知客户端
    fn error(&self, message: &str) {
        error!(scope = %self.name(), error = %message, "scope error");
        self.channel().send(Message::new(ScopeEvent::Error {
            scope: self.name().to_string(),
            message: message.to_string(),
        }));
    }
}

/// 已认证用户的身份
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub username: String,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

#[derive(Clone)]
pub struct UserScope {
    identity: Identity,
    channel: ScopeChannel,
    services: Services,
    data: Parameters,
}

impl UserScope {
    pub fn new(identity: Identity, channel: ScopeChannel, services: Services) -> Self {
        Self {
            identity,
            channel,
            services,
            data: Parameters::new(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// 派生会话 scope
    pub fn session(&self, name: impl Into<String>, geometry: Option<Geometry>) -> SessionScope {
        SessionScope {
            user: self.clone(),
            name: name.into(),
            geometry,
            data: self.data.clone(),
        }
    }
}

impl Scope for UserScope {
    fn name(&self) -> &str {
        &self.identity.username
    }

    fn channel(&self) -> &ScopeChannel {
        &self.channel
    }

    fn services(&self) -> &Services {
        &self.services
    }

    fn data(&self) -> &Parameters {
        &self.data
    }
}

impl fmt::Debug for UserScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserScope").field("identity", &self.identity).finish()
    }
}

#[derive(Clone)]
pub struct SessionScope {
    user: UserScope,
    name: String,
    geometry: Option<Geometry>,
    data: Parameters,
}

impl SessionScope {
    pub fn user(&self) -> &UserScope {
        &self.user
    }

    pub fn geometry(&self) -> Option<&Geometry> {
        self.geometry.as_ref()
    }

    /// 派生上下文 scope；未指定几何时继承会话几何
    pub fn context(&self, name: impl Into<String>, geometry: Option<Geometry>) -> ContextScope {
        ContextScope {
            session: self.clone(),
            name: name.into(),
            geometry: geometry.or_else(|| self.geometry.clone()).unwrap_or_default(),
            observer: None,
            derivation: None,
            data: self.data.clone(),
        }
    }
}

impl Scope for SessionScope {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel(&self) -> &ScopeChannel {
        self.user.channel()
    }

    fn services(&self) -> &Services {
        self.user.services()
    }

    fn data(&self) -> &Parameters {
        &self.data
    }
}

impl fmt::Debug for SessionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionScope")
            .field("user", &self.user.identity.username)
            .field("name", &self.name)
            .field("geometry", &self.geometry)
            .finish()
    }
}

#[derive(Clone)]
pub struct ContextScope {
    session: SessionScope,
    name: String,
    geometry: Geometry,
    observer: Option<AgentRef<ContextMessage>>,
    derivation: Option<Derivation>,
    data: Parameters,
}

impl ContextScope {
    pub fn session(&self) -> &SessionScope {
        &self.session
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// 上下文 Agent 自身的引用（派生观测请求的目标）
    pub fn observer(&self) -> Option<&AgentRef<ContextMessage>> {
        self.observer.as_ref()
    }

    pub fn derivation(&self) -> Option<&Derivation> {
        self.derivation.as_ref()
    }

    pub(crate) fn bind(&mut self, observer: AgentRef<ContextMessage>) {
        self.observer = Some(observer);
    }

    /// 单次观测使用的 scope：可覆盖几何并携带派生信息
    pub fn for_observation(&self, geometry: Option<Geometry>, derivation: Option<Derivation>) -> ContextScope {
        let mut scope = self.clone();
        if let Some(geometry) = geometry {
            scope.geometry = geometry;
        }
        scope.derivation = derivation;
        scope
    }
}

impl Scope for ContextScope {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel(&self) -> &ScopeChannel {
        self.session.channel()
    }

    fn services(&self) -> &Services {
        self.session.services()
    }

    fn data(&self) -> &Parameters {
        &self.data
    }
}

impl TwinScope for ContextScope {
    /// 派生观测通过 tell 回到本上下文的 mailbox，重新走解析流程
    fn request_observation(&self, request: ObservationRequest) {
        let Some(observer) = &self.observer else {
            warn!(urn = %request.urn, scope = %self.name, "context not bound, observation request dropped");
            return;
        };
        self.channel().send(Message::new(ScopeEvent::ObservationRequested {
            scope: self.name.clone(),
            urn: request.urn.clone(),
            derivation_depth: request.derivation_depth,
        }));
        observer.tell(ContextMessage::Observe(Observe::from(request)));
    }

    fn error(&self, message: &str) {
        Scope::error(self, message);
    }
}

impl fmt::Debug for ContextScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextScope")
            .field("session", &self.session.name)
            .field("name", &self.name)
            .field("geometry", &self.geometry)
            .field("observer", &self.observer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_inherits_session_geometry() {
        let (channel, _rx) = ScopeChannel::new();
        let user = UserScope::new(Identity::new("alice"), channel, Services::local());
        let geometry = Geometry::empty().with_space(serde_json::json!({"bbox": [0, 0, 1, 1]}));
        let session = user.session("alice-1", Some(geometry.clone()));
        let context = session.context("ctx", None);
        assert_eq!(context.geometry(), &geometry);
        assert_eq!(context.session().user().identity().username, "alice");
        assert!(context.observer().is_none());
    }

    #[test]
    fn test_error_reaches_channel() {
        let (channel, mut rx) = ScopeChannel::new();
        let user = UserScope::new(Identity::new("bob"), channel, Services::local());
        user.error("boom");
        let message = rx.try_recv().unwrap();
        assert!(matches!(message.payload(), ScopeEvent::Error { message, .. } if message == "boom"));
    }
}
