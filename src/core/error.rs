//! 错误类型：Agent 运行时、外部服务与数字孪生
//!
//! Agent 处理器返回 AgentError 时由 mailbox 循环上报到 scope.error，Agent 继续处理后续消息；
//! 调度器契约违规（未提交即 submit、重复 submit）不走这里：以 ContractViolation 为载荷 panic，
//! mailbox 循环识别后停止 Agent 并按 FatalError 触发关闭。

use thiserror::Error;

use crate::twin::ObservationId;

/// Agent 运行过程中可能出现的错误（处理器失败、初始化失败、scratch 资源等）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(&'static str),

    /// 上下文 Agent 尚未绑定数字孪生（已停止或被 dispose）
    #[error("No digital twin bound to {0}")]
    NoDigitalTwin(String),

    #[error("Scratch storage error: {0}")]
    Scratch(#[from] std::io::Error),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Twin(#[from] TwinError),
}

/// 外部协作服务（推理器、解析器、运行时、行为库）的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("Cannot resolve URN {0}")]
    UnresolvableUrn(String),

    #[error("Resolution failed: {0}")]
    ResolutionFailed(String),

    #[error("Runtime failed: {0}")]
    RuntimeFailed(String),

    #[error("Observation aborted: {0}")]
    Aborted(String),
}

/// 知识图谱与数字孪生的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TwinError {
    #[error("Unknown parent observation {0}")]
    UnknownParent(ObservationId),

    #[error("Unknown observation {0}")]
    UnknownObservation(ObservationId),

    #[error("Digital twin {0} is disposed")]
    Disposed(String),

    #[error("Invalid link {from} -> {to}: {reason}")]
    InvalidLink {
        from: ObservationId,
        to: ObservationId,
        reason: &'static str,
    },
}

/// 调度器契约违规，作为 panic 载荷使用，不可恢复
#[derive(Error, Debug, Clone, PartialEq)]
#[error("scheduler contract violated: {0}")]
pub struct ContractViolation(pub String);
