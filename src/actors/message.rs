//! 消息：不可变、可寻址的 Agent 间通信单元
//!
//! 每条消息携带进程内唯一的 id（原子计数器）、负载、可选的关联 id（回复时指向请求）、
//! 创建时间戳与可重复性；回复通过 `in_response_to` 与请求配对。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::agent_ref::AgentRef;
use super::context::{ContextMessage, ObserveOutcome};
use super::session::SessionMessage;
use crate::twin::TwinSummary;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// 消息 id；0 表示"无"（未关联任何请求）
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct MessageId(u64);

impl MessageId {
    pub const NONE: MessageId = MessageId(0);

    fn next() -> Self {
        Self(NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg#{}", self.0)
    }
}

/// 同一请求下同类消息是否可多次发送（如 Started 状态）
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Repeatability {
    #[default]
    Once,
    Repeatable,
}

/// 消息负载的类型标签，用于日志与诊断
pub trait MessageKind: Send + fmt::Debug + 'static {
    fn tag(&self) -> &'static str;
}

/// 可投递给 Agent 的消息种类：每种都包含基础消息（SetState / RunBehavior）
pub trait AgentMessage: MessageKind + From<CoreMessage> + Sized {
    /// 取出基础消息；不是基础消息时原样返回
    fn into_core(self) -> Result<CoreMessage, Self>;
}

#[derive(Clone, Debug, Serialize)]
pub struct Message<P> {
    id: MessageId,
    payload: P,
    in_response_to: MessageId,
    timestamp: i64,
    repeatability: Repeatability,
}

impl<P> Message<P> {
    pub fn new(payload: P) -> Self {
        Self {
            id: MessageId::next(),
            payload,
            in_response_to: MessageId::NONE,
            timestamp: chrono::Utc::now().timestamp_millis(),
            repeatability: Repeatability::Once,
        }
    }

    /// 作为 request 的回复
    pub fn response_to(request: MessageId, payload: P) -> Self {
        Self {
            in_response_to: request,
            ..Self::new(payload)
        }
    }

    pub fn repeatable(mut self) -> Self {
        self.repeatability = Repeatability::Repeatable;
        self
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    pub fn in_response_to(&self) -> MessageId {
        self.in_response_to
    }

    pub fn is_response(&self) -> bool {
        !self.in_response_to.is_none()
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn repeatability(&self) -> Repeatability {
        self.repeatability
    }

    /// 保留 id、关联与时间戳，替换负载
    fn with_payload<Q>(self, payload: Q) -> Message<Q> {
        Message {
            id: self.id,
            payload,
            in_response_to: self.in_response_to,
            timestamp: self.timestamp,
            repeatability: self.repeatability,
        }
    }
}

impl<M: AgentMessage> Message<M> {
    pub(crate) fn into_core(self) -> Result<Message<CoreMessage>, Message<M>> {
        let Message {
            id,
            payload,
            in_response_to,
            timestamp,
            repeatability,
        } = self;
        let shell = Message {
            id,
            payload: (),
            in_response_to,
            timestamp,
            repeatability,
        };
        match payload.into_core() {
            Ok(core) => Ok(shell.with_payload(core)),
            Err(payload) => Err(shell.with_payload(payload)),
        }
    }
}

/// 所有 Agent 都接受的基础消息
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreMessage {
    /// 写入 Agent 全局状态（行为运行时修改 Agent 状态的唯一途径）
    SetState { key: String, value: serde_json::Value },
    /// 通过行为库解析并运行行为
    RunBehavior { behavior: String },
}

impl MessageKind for CoreMessage {
    fn tag(&self) -> &'static str {
        match self {
            CoreMessage::SetState { .. } => "SetState",
            CoreMessage::RunBehavior { .. } => "RunBehavior",
        }
    }
}

/// ask 的回复负载
#[derive(Debug)]
pub enum Response {
    Ack,
    Session(AgentRef<SessionMessage>),
    Context(AgentRef<ContextMessage>),
    Observation(ObserveOutcome),
    Twin(TwinSummary),
}

impl MessageKind for Response {
    fn tag(&self) -> &'static str {
        match self {
            Response::Ack => "Ack",
            Response::Session(_) => "Session",
            Response::Context(_) => "Context",
            Response::Observation(_) => "Observation",
            Response::Twin(_) => "Twin",
        }
    }
}

/// 确认回复
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ack;

/// ask 的类型化结果：从回复负载中取出期望的类型
pub trait FromResponse: Sized {
    fn from_response(response: Response) -> Option<Self>;
}

impl FromResponse for Response {
    fn from_response(response: Response) -> Option<Self> {
        Some(response)
    }
}

impl FromResponse for Ack {
    fn from_response(response: Response) -> Option<Self> {
        matches!(response, Response::Ack).then_some(Ack)
    }
}

impl FromResponse for AgentRef<SessionMessage> {
    fn from_response(response: Response) -> Option<Self> {
        match response {
            Response::Session(session) => Some(session),
            _ => None,
        }
    }
}

impl FromResponse for AgentRef<ContextMessage> {
    fn from_response(response: Response) -> Option<Self> {
        match response {
            Response::Context(context) => Some(context),
            _ => None,
        }
    }
}

impl FromResponse for ObserveOutcome {
    fn from_response(response: Response) -> Option<Self> {
        match response {
            Response::Observation(outcome) => Some(outcome),
            _ => None,
        }
    }
}

impl FromResponse for TwinSummary {
    fn from_response(response: Response) -> Option<Self> {
        match response {
            Response::Twin(summary) => Some(summary),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let a = Message::new(());
        let b = Message::new(());
        assert!(b.id() > a.id());
        assert!(!a.is_response());
        assert_eq!(a.repeatability(), Repeatability::Once);
    }

    #[test]
    fn test_response_correlation() {
        let request = Message::new("ping");
        let reply = Message::response_to(request.id(), "pong").repeatable();
        assert_eq!(reply.in_response_to(), request.id());
        assert_ne!(reply.id(), request.id());
        assert_eq!(reply.repeatability(), Repeatability::Repeatable);
    }

    #[test]
    fn test_typed_responses() {
        assert_eq!(Ack::from_response(Response::Ack), Some(Ack));
        assert!(Ack::from_response(Response::Observation(ObserveOutcome::empty())).is_none());
    }
}
