//! Twinrt - 数字孪生运行时
//!
//! 模块划分：
//! - **actors**: Agent 层级（User / Session / Context）、消息、引用、mailbox 运行时
//! - **behavior**: 行为脚本与每个 Agent 的行为引擎
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、生命周期、监管树、优雅关闭
//! - **observability**: 日志初始化
//! - **services**: 推理器 / 解析器 / 运行时 / 行为库接口与进程内实现
//! - **system**: 根 Agent 的创建与整体关闭
//! - **twin**: 数字孪生（知识图谱 + 时间调度器）

pub mod actors;
pub mod behavior;
pub mod config;
pub mod core;
pub mod observability;
pub mod services;
pub mod system;
pub mod twin;

pub use actors::{AgentRef, ContextMessage, Observe, ObserveOutcome, SessionMessage, UserMessage};
pub use system::AgentSystem;
pub use twin::{DigitalTwin, Scheduler};
