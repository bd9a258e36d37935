//! 外部协作服务：推理器、解析器、运行时、行为库
//!
//! 上下文 Agent 按 reasoner → resolver → runtime 的顺序解析观测；
//! 运行时负责提交到知识图谱、注册执行器并在提交后调用调度器的 submit。

pub mod local;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::actors::ContextScope;
use crate::behavior::Behavior;
use crate::core::ServiceError;
use crate::twin::{DigitalTwin, Geometry, Observable, Observation, ObservationId};

pub use local::{LocalBehaviorLibrary, LocalReasoner, LocalResolver, LocalRuntime};

/// URN 分类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum UrnKind {
    /// 命名空间中的模型对象，如 `ns.sub.model`
    KimObject,
    /// 可观测量表达式，如 `geography:Elevation`、`change in earth:Temperature`
    Observable,
    RemoteUrl,
    /// 资源 URN，如 `local:alice:project:dataset`
    Resource,
    Unknown,
}

impl UrnKind {
    pub fn classify(urn: &str) -> UrnKind {
        let urn = urn.trim();
        if urn.is_empty() {
            return UrnKind::Unknown;
        }
        if urn.starts_with("http://") || urn.starts_with("https://") {
            return UrnKind::RemoteUrl;
        }
        let has_space = urn.contains(char::is_whitespace);
        let segments = urn.split(':').count();
        if !has_space && segments >= 4 {
            return UrnKind::Resource;
        }
        if has_space || segments == 2 {
            return UrnKind::Observable;
        }
        if urn.contains('.') {
            return UrnKind::KimObject;
        }
        UrnKind::Unknown
    }
}

/// 推理器给出的知识：可观测量
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Knowledge {
    pub urn: String,
    pub observable: Observable,
}

/// 计算单元；子单元对应结构子观测
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Actuator {
    pub name: String,
    pub observable: Observable,
    pub children: Vec<Actuator>,
}

impl Actuator {
    pub fn new(observable: Observable) -> Self {
        let name = Observation::new(observable.clone(), Geometry::empty()).name;
        Self {
            name,
            observable,
            children: Vec::new(),
        }
    }
}

/// 解析器产出的数据流；empty 表示无法观测
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Dataflow {
    pub geometry: Geometry,
    pub actuators: Vec<Actuator>,
    /// 派生观测的触发者（AFFECTS 的源）
    pub derived_from: Option<ObservationId>,
    pub derivation_depth: u32,
}

impl Dataflow {
    pub fn empty() -> Self {
        Self {
            geometry: Geometry::empty(),
            actuators: Vec::new(),
            derived_from: None,
            derivation_depth: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actuators.is_empty()
    }
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    /// URN → 知识；无法识别时返回 None
    async fn resolve_knowledge(&self, urn: &str) -> Result<Option<Knowledge>, ServiceError>;
}

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, knowledge: &Knowledge, scope: &ContextScope) -> Result<Dataflow, ServiceError>;
}

#[async_trait]
pub trait RuntimeService: Send + Sync {
    /// 运行数据流：提交、注册执行器、submit；返回根观测
    async fn run(&self, dataflow: &Dataflow, twin: &mut DigitalTwin, scope: &ContextScope) -> Result<Observation, ServiceError>;
}

pub trait BehaviorLibrary: Send + Sync {
    fn resolve_behavior(&self, urn: &str) -> Option<Behavior>;
}

/// 一组服务实现，随 scope 向下传递
#[derive(Clone)]
pub struct Services {
    pub reasoner: Arc<dyn Reasoner>,
    pub resolver: Arc<dyn Resolver>,
    pub runtime: Arc<dyn RuntimeService>,
    pub behaviors: Arc<dyn BehaviorLibrary>,
}

impl Services {
    /// 进程内实现
    pub fn local() -> Self {
        Self {
            reasoner: Arc::new(LocalReasoner::new()),
            resolver: Arc::new(LocalResolver::new()),
            runtime: Arc::new(LocalRuntime::new()),
            behaviors: Arc::new(LocalBehaviorLibrary::new()),
        }
    }

    pub fn with_reasoner(mut self, reasoner: Arc<dyn Reasoner>) -> Self {
        self.reasoner = reasoner;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn RuntimeService>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_behaviors(mut self, behaviors: Arc<dyn BehaviorLibrary>) -> Self {
        self.behaviors = behaviors;
        self
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Services")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_urns() {
        assert_eq!(UrnKind::classify("geography:Elevation"), UrnKind::Observable);
        assert_eq!(UrnKind::classify("change in earth:Temperature"), UrnKind::Observable);
        assert_eq!(UrnKind::classify("https://example.org/data"), UrnKind::RemoteUrl);
        assert_eq!(UrnKind::classify("local:alice:project:dem"), UrnKind::Resource);
        assert_eq!(UrnKind::classify("hydrology.models.runoff"), UrnKind::KimObject);
        assert_eq!(UrnKind::classify("   "), UrnKind::Unknown);
        assert_eq!(UrnKind::classify("plainword"), UrnKind::Unknown);
    }
}
