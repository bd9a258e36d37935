//! Agent 层级：消息、引用、基础运行时与 User / Session / Context 三类 Agent
//!
//! 所有权树：User 拥有 Session，Session 拥有 Context，Context 拥有其数字孪生。
//! 引用（AgentRef）只能发消息，不能停止 Agent；停止经由所有者的 AgentHandle 或父 Agent。

pub mod agent;
pub mod agent_ref;
pub mod context;
pub mod message;
pub mod scope;
pub mod session;
pub mod user;

pub use agent::{Agent, AgentContext, AgentHandle, AgentSettings};
pub use agent_ref::{AgentRef, DEFAULT_ASK_TIMEOUT};
pub use context::{ContextAgent, ContextMessage, Derivation, Observe, ObserveOutcome};
pub use message::{Ack, AgentMessage, CoreMessage, FromResponse, Message, MessageId, MessageKind, Repeatability, Response};
pub use scope::{
    ContextScope, Identity, ObservationStatus, Parameters, Scope, ScopeChannel, ScopeEvent, SessionScope, UserScope,
};
pub use session::{CreateContext, SessionAgent, SessionMessage};
pub use user::{CreateSession, UserAgent, UserMessage};
