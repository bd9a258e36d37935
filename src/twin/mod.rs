//! 数字孪生：知识图谱 + 调度器
//!
//! - **time**: 时间点、分辨率、时间范围
//! - **observation**: 观测、可观测量、几何
//! - **knowledge_graph**: 提交与结构关系
//! - **event**: 投递给执行器的事件
//! - **executor**: 执行器注册表与执行器回调 scope
//! - **scheduler**: 纪元、分辨率、时间迁移投递

pub mod event;
pub mod executor;
pub mod knowledge_graph;
pub mod observation;
pub mod scheduler;
pub mod time;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

pub use event::{Event, EventType};
pub use executor::{DetachedScope, Executor, ExecutorTable, TwinScope};
pub use knowledge_graph::{Activity, KnowledgeGraph, Relationship};
pub use observation::{Geometry, Observable, Observation, ObservationId, ObservationRequest, SemanticType};
pub use scheduler::{Registration, Scheduler};
pub use time::{Resolution, ResolutionUnit, TimeExtent, TimeInstant};

use crate::config::SchedulerSection;
use crate::core::TwinError;

/// 数字孪生的概要（DescribeTwin 的回复）
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TwinSummary {
    pub id: String,
    pub observations: usize,
    pub epoch_start: Option<TimeInstant>,
    pub epoch_end: Option<TimeInstant>,
    pub resolution: Option<Resolution>,
    pub current_time: Option<TimeInstant>,
    pub disposed: bool,
}

impl TwinSummary {
    pub fn is_empty(&self) -> bool {
        self.observations == 0
    }
}

/// 一个上下文 Agent 独占的数字孪生
pub struct DigitalTwin {
    id: String,
    graph: KnowledgeGraph,
    scheduler: Scheduler,
    disposed: bool,
}

impl DigitalTwin {
    pub fn new(config: SchedulerSection) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            graph: KnowledgeGraph::new(),
            scheduler: Scheduler::new(config),
            disposed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn graph(&self) -> &KnowledgeGraph {
        &self.graph
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn bind_scope(&mut self, scope: Arc<dyn TwinScope>) {
        self.scheduler.bind_scope(scope);
    }

    /// 提交观测到知识图谱，返回带 id 的观测副本
    pub fn commit(&mut self, observation: Observation, parent: Option<ObservationId>) -> Result<Observation, TwinError> {
        self.ensure_live()?;
        let id = self.graph.add(observation, parent)?;
        self.graph.get(id).cloned().ok_or(TwinError::UnknownObservation(id))
    }

    pub fn link(&mut self, source: ObservationId, target: ObservationId, relationship: Relationship) -> Result<(), TwinError> {
        self.ensure_live()?;
        self.graph.link(source, target, relationship)
    }

    pub fn record_activity(&mut self, description: impl Into<String>) -> Activity {
        self.graph.record_activity(description)
    }

    pub fn register_executor(&mut self, id: ObservationId, executor: Arc<dyn Executor>) {
        self.scheduler.register_executor(id, executor);
    }

    /// 把已提交的根观测交给调度器
    pub fn submit(&mut self, observation: &Observation, activity: &Activity) -> Result<(), TwinError> {
        self.ensure_live()?;
        self.scheduler.submit(&self.graph, observation, activity);
        Ok(())
    }

    pub fn advance_to(&mut self, t: TimeInstant) -> Result<usize, TwinError> {
        self.ensure_live()?;
        Ok(self.scheduler.advance_to(&self.graph, t))
    }

    pub fn summary(&self) -> TwinSummary {
        TwinSummary {
            id: self.id.clone(),
            observations: self.graph.len(),
            epoch_start: self.scheduler.epoch_start(),
            epoch_end: self.scheduler.epoch_end(),
            resolution: self.scheduler.resolution(),
            current_time: self.scheduler.current_time(),
            disposed: self.disposed,
        }
    }

    /// 释放图谱与调度状态；重复调用无效果，返回是否是首次释放
    pub fn dispose(&mut self) -> bool {
        if self.disposed {
            return false;
        }
        self.disposed = true;
        self.scheduler.reset();
        self.graph.clear();
        info!(twin = %self.id, "digital twin disposed");
        true
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn ensure_live(&self) -> Result<(), TwinError> {
        if self.disposed {
            Err(TwinError::Disposed(self.id.clone()))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for DigitalTwin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigitalTwin")
            .field("id", &self.id)
            .field("observations", &self.graph.len())
            .field("scheduler", &self.scheduler)
            .field("disposed", &self.disposed)
            .finish()
    }
}
