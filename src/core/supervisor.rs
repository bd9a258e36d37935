//! 监管：取消令牌树与子 Agent 的停止等待
//!
//! 每个 Agent 持有一个 Supervisor；子 Agent 的 token 是父 token 的 child_token，
//! 取消父 token 即级联取消所有后代。停止时先取消再逐个等待子 Agent 进入 stopped。

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::state::Lifecycle;

/// 被监管的子 Agent
#[derive(Debug)]
struct Child {
    name: String,
    token: CancellationToken,
    lifecycle: watch::Receiver<Lifecycle>,
}

#[derive(Debug)]
pub struct Supervisor {
    cancel_token: CancellationToken,
    children: Vec<Child>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            children: Vec::new(),
        }
    }

    /// 以 parent 的子 token 作为自己的 token
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self {
            cancel_token: parent.child_token(),
            children: Vec::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 创建子 token（用于子 Agent 或单个行为运行）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub(crate) fn adopt(&mut self, name: impl Into<String>, token: CancellationToken, lifecycle: watch::Receiver<Lifecycle>) {
        self.children.retain(|c| !c.lifecycle.borrow().is_terminal());
        self.children.push(Child {
            name: name.into(),
            token,
            lifecycle,
        });
    }

    /// 仍在运行的子 Agent 数
    pub fn child_count(&self) -> usize {
        self.children
            .iter()
            .filter(|c| !c.lifecycle.borrow().is_terminal())
            .count()
    }

    /// 取消并等待所有子 Agent 停止；单个子 Agent 超时只记录警告
    pub async fn stop_children(&mut self, timeout: Duration) {
        for child in &self.children {
            child.token.cancel();
        }
        for mut child in self.children.drain(..) {
            let waited = tokio::time::timeout(timeout, child.lifecycle.wait_for(|s| s.is_terminal())).await;
            match waited {
                Ok(_) => debug!(agent = %child.name, "child stopped"),
                Err(_) => warn!(agent = %child.name, timeout_ms = timeout.as_millis() as u64, "child did not stop in time"),
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
