//! 核心层：错误类型、生命周期状态、监管树、优雅关闭

pub mod error;
pub mod shutdown;
pub mod state;
pub mod supervisor;

pub use error::{AgentError, ContractViolation, ServiceError, TwinError};
pub use shutdown::{AgentTreeCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use state::Lifecycle;
pub use supervisor::Supervisor;
