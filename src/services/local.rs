//! 进程内服务实现（无需外部推理/解析服务）
//!
//! 推理器按注册表与 URN 形式推断语义类型；解析器生成单根数据流；
//! 运行时提交观测树、注册执行器并 submit 根观测。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use super::{Actuator, BehaviorLibrary, Dataflow, Knowledge, Reasoner, Resolver, RuntimeService, UrnKind};
use crate::actors::{ContextScope, Scope};
use crate::behavior::Behavior;
use crate::core::ServiceError;
use crate::twin::{
    DigitalTwin, Event, EventType, Executor, Geometry, Observable, Observation, ObservationId, Relationship,
    SemanticType, TwinScope,
};

/// 本地推理器：已注册概念优先，"change in X" 为 Change，其余可观测量表达式视为 Quality
#[derive(Debug, Default)]
pub struct LocalReasoner {
    concepts: HashMap<String, SemanticType>,
}

impl LocalReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concept(mut self, urn: impl Into<String>, semantic_type: SemanticType) -> Self {
        self.concepts.insert(urn.into(), semantic_type);
        self
    }
}

#[async_trait]
impl Reasoner for LocalReasoner {
    async fn resolve_knowledge(&self, urn: &str) -> Result<Option<Knowledge>, ServiceError> {
        let urn = urn.trim();
        let semantic_type = if urn.starts_with("change in ") {
            Some(SemanticType::Change)
        } else if let Some(t) = self.concepts.get(urn) {
            Some(*t)
        } else if UrnKind::classify(urn) == UrnKind::Observable {
            Some(SemanticType::Quality)
        } else {
            None
        };
        Ok(semantic_type.map(|t| Knowledge {
            urn: urn.to_string(),
            observable: Observable::new(urn, t),
        }))
    }
}

/// 本地解析器：可观测量 → 单个根 actuator，依赖注册为子 actuator
#[derive(Debug, Default)]
pub struct LocalResolver {
    dependencies: HashMap<String, Vec<Observable>>,
}

impl LocalResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dependency(mut self, urn: impl Into<String>, dependency: Observable) -> Self {
        self.dependencies.entry(urn.into()).or_default().push(dependency);
        self
    }
}

#[async_trait]
impl Resolver for LocalResolver {
    async fn resolve(&self, knowledge: &Knowledge, scope: &ContextScope) -> Result<Dataflow, ServiceError> {
        let mut root = Actuator::new(knowledge.observable.clone());
        if let Some(dependencies) = self.dependencies.get(&knowledge.urn) {
            root.children = dependencies.iter().cloned().map(Actuator::new).collect();
        }
        let derivation = scope.derivation();
        Ok(Dataflow {
            geometry: scope.geometry().clone(),
            actuators: vec![root],
            derived_from: derivation.and_then(|d| d.parent),
            derivation_depth: derivation.map(|d| d.depth).unwrap_or(0),
        })
    }
}

/// 为 actuator 创建执行器
pub type ExecutorFactory = Arc<dyn Fn(&Actuator) -> Arc<dyn Executor> + Send + Sync>;

/// 默认执行器：初始化与时间迁移时重新计算（报告变化），事件只记录
struct RecomputeExecutor {
    name: String,
}

impl Executor for RecomputeExecutor {
    fn execute(&self, _geometry: &Geometry, event: &Event, _scope: &dyn TwinScope) -> bool {
        debug!(observation = %self.name, event = ?event.event_type, at = %event.start(), "executing");
        event.event_type != EventType::Event
    }
}

/// 本地运行时
#[derive(Default)]
pub struct LocalRuntime {
    factory: Option<ExecutorFactory>,
}

impl LocalRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_executors(factory: ExecutorFactory) -> Self {
        Self { factory: Some(factory) }
    }

    fn executor_for(&self, actuator: &Actuator) -> Arc<dyn Executor> {
        match &self.factory {
            Some(factory) => factory(actuator),
            None => Arc::new(RecomputeExecutor {
                name: actuator.name.clone(),
            }),
        }
    }

    /// 深度优先提交 actuator 树，父先于子
    fn commit_tree(
        &self,
        twin: &mut DigitalTwin,
        actuator: &Actuator,
        parent: Option<ObservationId>,
        dataflow: &Dataflow,
    ) -> Result<Observation, ServiceError> {
        let observation = Observation::new(actuator.observable.clone(), dataflow.geometry.clone())
            .derived(dataflow.derivation_depth);
        let committed = twin.commit(observation, parent).map_err(runtime_failure)?;
        let id = committed
            .id
            .ok_or_else(|| ServiceError::RuntimeFailed(format!("{} committed without id", actuator.name)))?;
        twin.register_executor(id, self.executor_for(actuator));
        for child in &actuator.children {
            self.commit_tree(twin, child, Some(id), dataflow)?;
        }
        Ok(committed)
    }
}

#[async_trait]
impl RuntimeService for LocalRuntime {
    async fn run(&self, dataflow: &Dataflow, twin: &mut DigitalTwin, scope: &ContextScope) -> Result<Observation, ServiceError> {
        let mut result = None;
        for actuator in &dataflow.actuators {
            let activity = twin.record_activity(format!("observe {} in {}", actuator.observable, scope.name()));
            let root = self.commit_tree(twin, actuator, None, dataflow)?;
            if let (Some(source), Some(target)) = (dataflow.derived_from, root.id) {
                if twin.graph().contains(source) {
                    twin.link(source, target, Relationship::Affects).map_err(runtime_failure)?;
                }
            }
            twin.submit(&root, &activity).map_err(runtime_failure)?;
            result.get_or_insert(root);
        }
        result.ok_or_else(|| ServiceError::RuntimeFailed("empty dataflow".into()))
    }
}

fn runtime_failure(e: crate::core::TwinError) -> ServiceError {
    ServiceError::RuntimeFailed(e.to_string())
}

/// 本地行为库
#[derive(Debug, Default)]
pub struct LocalBehaviorLibrary {
    behaviors: RwLock<HashMap<String, Behavior>>,
}

impl LocalBehaviorLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(self, behavior: Behavior) -> Self {
        self.register(behavior);
        self
    }

    pub fn register(&self, behavior: Behavior) {
        if let Ok(mut behaviors) = self.behaviors.write() {
            behaviors.insert(behavior.urn.clone(), behavior);
        }
    }
}

impl BehaviorLibrary for LocalBehaviorLibrary {
    fn resolve_behavior(&self, urn: &str) -> Option<Behavior> {
        self.behaviors.read().ok()?.get(urn).cloned()
    }
}
