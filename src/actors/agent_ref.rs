//! Agent 引用：不透明、可复制、可序列化的地址句柄
//!
//! 引用不拥有 Agent；tell 即发即忘，ask 带超时等待关联回复。spawn 失败时返回空引用，
//! 对空引用的 tell 只记录日志，ask 立即返回 None。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use super::message::{FromResponse, Message, MessageKind, Response};
use crate::core::Lifecycle;

/// ask 的默认超时
pub const DEFAULT_ASK_TIMEOUT: Duration = Duration::from_secs(2);

/// mailbox 中的一项：普通消息或带回复通道的请求
pub(crate) enum Envelope<M> {
    Tell(Message<M>),
    Ask {
        message: Message<M>,
        reply: oneshot::Sender<Message<Response>>,
    },
}

impl<M> Envelope<M> {
    pub(crate) fn into_parts(self) -> (Message<M>, Option<oneshot::Sender<Message<Response>>>) {
        match self {
            Envelope::Tell(message) => (message, None),
            Envelope::Ask { message, reply } => (message, Some(reply)),
        }
    }
}

pub struct AgentRef<M> {
    address: Arc<str>,
    mailbox: Option<mpsc::UnboundedSender<Envelope<M>>>,
    lifecycle: Option<watch::Receiver<Lifecycle>>,
}

impl<M> Clone for AgentRef<M> {
    fn clone(&self) -> Self {
        Self {
            address: self.address.clone(),
            mailbox: self.mailbox.clone(),
            lifecycle: self.lifecycle.clone(),
        }
    }
}

impl<M: MessageKind> AgentRef<M> {
    pub(crate) fn new(
        address: impl Into<Arc<str>>,
        mailbox: mpsc::UnboundedSender<Envelope<M>>,
        lifecycle: watch::Receiver<Lifecycle>,
    ) -> Self {
        Self {
            address: address.into(),
            mailbox: Some(mailbox),
            lifecycle: Some(lifecycle),
        }
    }

    /// 空引用：spawn 失败或超时的结果
    pub fn empty() -> Self {
        Self {
            address: Arc::from(""),
            mailbox: None,
            lifecycle: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mailbox.is_none()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(Lifecycle::Stopped)
    }

    pub fn is_alive(&self) -> bool {
        !self.is_empty() && self.lifecycle().accepts_messages()
    }

    /// 即发即忘
    pub fn tell(&self, payload: M) {
        self.send(Message::new(payload));
    }

    pub fn send(&self, message: Message<M>) {
        let Some(mailbox) = &self.mailbox else {
            warn!(tag = message.payload().tag(), "tell on empty agent reference dropped");
            return;
        };
        let tag = message.payload().tag();
        if mailbox.send(Envelope::Tell(message)).is_err() {
            warn!(agent = %self.address, tag, "agent mailbox closed, message dropped");
        }
    }

    /// 请求-回复：超时、Agent 已停止或回复类型不符时返回 None
    pub async fn ask<R: FromResponse>(&self, payload: M, timeout: Duration) -> Option<R> {
        self.request(Message::new(payload), timeout).await
    }

    pub async fn request<R: FromResponse>(&self, message: Message<M>, timeout: Duration) -> Option<R> {
        let reply = self.request_message(message, timeout).await?;
        let tag = reply.payload().tag();
        let typed = R::from_response(reply.into_payload());
        if typed.is_none() {
            warn!(agent = %self.address, tag, "reply has unexpected type");
        }
        typed
    }

    /// 请求并返回原始回复消息（含关联 id）
    pub async fn request_message(&self, message: Message<M>, timeout: Duration) -> Option<Message<Response>> {
        let Some(mailbox) = &self.mailbox else {
            debug!(tag = message.payload().tag(), "ask on empty agent reference");
            return None;
        };
        let request_id = message.id();
        let tag = message.payload().tag();
        let (reply_tx, reply_rx) = oneshot::channel();
        if mailbox
            .send(Envelope::Ask {
                message,
                reply: reply_tx,
            })
            .is_err()
        {
            warn!(agent = %self.address, tag, "agent mailbox closed, ask dropped");
            return None;
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) if reply.in_response_to() == request_id => Some(reply),
            Ok(Ok(reply)) => {
                warn!(
                    agent = %self.address,
                    expected = %request_id,
                    got = %reply.in_response_to(),
                    "uncorrelated reply discarded"
                );
                None
            }
            Ok(Err(_)) => {
                debug!(agent = %self.address, tag, "request finished without reply");
                None
            }
            Err(_) => {
                warn!(agent = %self.address, tag, timeout_ms = timeout.as_millis() as u64, "ask timed out");
                None
            }
        }
    }

    /// 等待 Agent 进入 stopped；空引用立即返回
    pub async fn stopped(&self) {
        let Some(mut rx) = self.lifecycle.clone() else {
            return;
        };
        let _ = rx.wait_for(|state| state.is_terminal()).await;
    }
}

impl<M> PartialEq for AgentRef<M> {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl<M> Eq for AgentRef<M> {}

impl<M> fmt::Debug for AgentRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mailbox.is_none() {
            write!(f, "AgentRef(EMPTY)")
        } else {
            write!(f, "AgentRef({})", self.address)
        }
    }
}

impl<M> fmt::Display for AgentRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mailbox.is_none() {
            f.write_str("EMPTY")
        } else {
            f.write_str(&self.address)
        }
    }
}

/// 序列化为地址；空引用序列化为 null
impl<M> Serialize for AgentRef<M> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.mailbox.is_none() {
            serializer.serialize_none()
        } else {
            serializer.serialize_str(&self.address)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::message::{Ack, CoreMessage};

    #[tokio::test]
    async fn test_empty_reference() {
        let empty: AgentRef<CoreMessage> = AgentRef::empty();
        assert!(empty.is_empty());
        assert!(!empty.is_alive());
        empty.tell(CoreMessage::RunBehavior { behavior: "noop".into() });
        let reply: Option<Ack> = empty
            .ask(CoreMessage::RunBehavior { behavior: "noop".into() }, Duration::from_millis(10))
            .await;
        assert!(reply.is_none());
        empty.stopped().await;
        assert_eq!(serde_json::to_string(&empty).unwrap(), "null");
    }

    #[tokio::test]
    async fn test_uncorrelated_reply_is_discarded() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope<CoreMessage>>();
        let (_state_tx, state_rx) = watch::channel(Lifecycle::Ready);
        let reference = AgentRef::new("worker.1", tx, state_rx);

        tokio::spawn(async move {
            if let Some(Envelope::Ask { reply, .. }) = rx.recv().await {
                let _ = reply.send(Message::response_to(Message::new(()).id(), Response::Ack));
            }
        });

        let reply: Option<Ack> = reference
            .ask(CoreMessage::RunBehavior { behavior: "x".into() }, Duration::from_millis(500))
            .await;
        assert!(reply.is_none());
        assert_eq!(serde_json::to_string(&reference).unwrap(), "\"worker.1\"");
    }
}
