//! 知识图谱：观测的提交（commit）、结构父子关系、AFFECTS 影响关系与活动记录
//!
//! 提交是调度前提：`add` 分配 id 后，调用方才能把根观测交给调度器。

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use super::observation::{Observation, ObservationId};
use crate::core::TwinError;

/// 图中的关系类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Relationship {
    /// 结构子观测
    Child,
    /// 源观测变化时目标观测需在同一时刻重新求值
    Affects,
}

/// 一次提交对应的活动（溯源记录）
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Activity {
    pub id: u64,
    pub description: String,
    pub created_at: i64,
}

#[derive(Debug, Default)]
pub struct KnowledgeGraph {
    next_id: u64,
    observations: BTreeMap<ObservationId, Observation>,
    parents: HashMap<ObservationId, ObservationId>,
    children: HashMap<ObservationId, Vec<ObservationId>>,
    affects: HashMap<ObservationId, Vec<ObservationId>>,
    activities: Vec<Activity>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 提交观测；parent 必须已在图中
    pub fn add(&mut self, mut observation: Observation, parent: Option<ObservationId>) -> Result<ObservationId, TwinError> {
        if let Some(parent) = parent {
            if !self.observations.contains_key(&parent) {
                return Err(TwinError::UnknownParent(parent));
            }
        }
        self.next_id += 1;
        let id = ObservationId(self.next_id);
        observation.id = Some(id);
        self.observations.insert(id, observation);
        if let Some(parent) = parent {
            self.parents.insert(id, parent);
            self.children.entry(parent).or_default().push(id);
        }
        Ok(id)
    }

    /// 记录 source 与 target 之间的关系
    ///
    /// Child 关系要求 target 尚无父观测且不是 source 的祖先，保证结构始终是森林。
    pub fn link(&mut self, source: ObservationId, target: ObservationId, relationship: Relationship) -> Result<(), TwinError> {
        for id in [source, target] {
            if !self.observations.contains_key(&id) {
                return Err(TwinError::UnknownObservation(id));
            }
        }
        let invalid = |reason| TwinError::InvalidLink {
            from: source,
            to: target,
            reason,
        };
        if source == target {
            return Err(invalid("self link"));
        }
        match relationship {
            Relationship::Affects => {
                let targets = self.affects.entry(source).or_default();
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
            Relationship::Child => {
                if self.parents.contains_key(&target) {
                    return Err(invalid("target already has a parent"));
                }
                if self.is_ancestor(target, source) {
                    return Err(invalid("link would create a cycle"));
                }
                self.parents.insert(target, source);
                self.children.entry(source).or_default().push(target);
            }
        }
        Ok(())
    }

    pub fn record_activity(&mut self, description: impl Into<String>) -> Activity {
        let activity = Activity {
            id: self.activities.len() as u64 + 1,
            description: description.into(),
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        self.activities.push(activity.clone());
        activity
    }

    pub fn get(&self, id: ObservationId) -> Option<&Observation> {
        self.observations.get(&id)
    }

    pub fn contains(&self, id: ObservationId) -> bool {
        self.observations.contains_key(&id)
    }

    pub fn parent(&self, id: ObservationId) -> Option<ObservationId> {
        self.parents.get(&id).copied()
    }

    /// 结构子观测，按提交顺序
    pub fn children(&self, id: ObservationId) -> &[ObservationId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn affected_by(&self, id: ObservationId) -> &[ObservationId] {
        self.affects.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// ancestor 是否在 id 的父链上
    pub fn is_ancestor(&self, ancestor: ObservationId, id: ObservationId) -> bool {
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            if parent == ancestor {
                return true;
            }
            current = parent;
        }
        false
    }

    pub fn roots(&self) -> impl Iterator<Item = &Observation> {
        self.observations
            .iter()
            .filter(|(id, _)| !self.parents.contains_key(id))
            .map(|(_, o)| o)
    }

    pub fn activities(&self) -> &[Activity] {
        &self.activities
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn clear(&mut self) {
        self.observations.clear();
        self.parents.clear();
        self.children.clear();
        self.affects.clear();
        self.activities.clear();
    }
}
