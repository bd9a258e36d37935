//! 生命周期状态：created → initializing → ready → stopping → stopped
//!
//! 状态只能前进；mailbox 循环通过 watch 通道发布当前阶段，引用持有者可据此等待 Agent 停止。

use serde::Serialize;

/// Agent 生命周期阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Created,
    Initializing,
    Ready,
    Stopping,
    Stopped,
}

impl Lifecycle {
    /// 是否允许从当前阶段迁移到 next（只前进，可跳过中间阶段）
    pub fn can_advance_to(&self, next: Lifecycle) -> bool {
        next > *self
    }

    /// 可以接收并处理消息
    pub fn accepts_messages(&self) -> bool {
        matches!(self, Lifecycle::Created | Lifecycle::Initializing | Lifecycle::Ready)
    }

    pub fn is_terminal(&self) -> bool {
        *self == Lifecycle::Stopped
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Lifecycle::Created => "created",
            Lifecycle::Initializing => "initializing",
            Lifecycle::Ready => "ready",
            Lifecycle::Stopping => "stopping",
            Lifecycle::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// 只前进地更新 watch 中的阶段；返回是否发生了迁移
pub(crate) fn advance(tx: &tokio::sync::watch::Sender<Lifecycle>, next: Lifecycle) -> bool {
    tx.send_if_modified(|current| {
        if current.can_advance_to(next) {
            *current = next;
            true
        } else {
            false
        }
    })
}
