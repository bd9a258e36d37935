//! 观测（Observation）与可观测量（Observable）
//!
//! 观测在提交到知识图谱时获得 id；只有已提交的观测可以交给调度器。

use std::fmt;

use serde::{Deserialize, Serialize};

use super::time::TimeExtent;

/// 知识图谱分配的观测 id
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct ObservationId(pub u64);

impl fmt::Display for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obs#{}", self.0)
    }
}

/// 语义类型；Process / Event / Change 天然是发生型（occurrent）
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    Quality,
    Subject,
    Process,
    Event,
    Relationship,
    Change,
}

impl SemanticType {
    pub fn is_occurrent(&self) -> bool {
        matches!(self, SemanticType::Process | SemanticType::Event | SemanticType::Change)
    }
}

/// 可观测量：URN + 语义类型
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Observable {
    pub urn: String,
    pub semantic_type: SemanticType,
}

impl Observable {
    pub fn new(urn: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self {
            urn: urn.into(),
            semantic_type,
        }
    }

    pub fn quality(urn: impl Into<String>) -> Self {
        Self::new(urn, SemanticType::Quality)
    }

    pub fn process(urn: impl Into<String>) -> Self {
        Self::new(urn, SemanticType::Process)
    }

    pub fn event(urn: impl Into<String>) -> Self {
        Self::new(urn, SemanticType::Event)
    }

    /// 派生可观测量 "change in X"
    pub fn change_in(&self) -> Observable {
        Observable::new(format!("change in {}", self.urn), SemanticType::Change)
    }

    pub fn is_change(&self) -> bool {
        self.semantic_type == SemanticType::Change
    }
}

impl fmt::Display for Observable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.urn)
    }
}

/// 观测的几何：空间部分不透明地作为数据传递，时间部分由调度器解释
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct Geometry {
    pub space: Option<serde_json::Value>,
    pub time: Option<TimeExtent>,
}

impl Geometry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_time(time: TimeExtent) -> Self {
        Self {
            space: None,
            time: Some(time),
        }
    }

    pub fn with_space(mut self, space: serde_json::Value) -> Self {
        self.space = Some(space);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.space.is_none() && self.time.is_none()
    }

    pub fn is_occurrent(&self) -> bool {
        self.time.map(|t| t.is_occurrent()).unwrap_or(false)
    }
}

/// 观测：可观测量在某个几何上的实例
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Observation {
    /// 提交到知识图谱前为 None
    pub id: Option<ObservationId>,
    pub name: String,
    pub observable: Observable,
    pub geometry: Geometry,
    /// 派生层数；直接观测为 0，"change in X" 为 1
    pub derivation_depth: u32,
}

impl Observation {
    pub fn new(observable: Observable, geometry: Geometry) -> Self {
        let name = observable
            .urn
            .rsplit(|c| c == ':' || c == ' ')
            .next()
            .unwrap_or(&observable.urn)
            .to_lowercase();
        Self {
            id: None,
            name,
            observable,
            geometry,
            derivation_depth: 0,
        }
    }

    pub fn derived(mut self, depth: u32) -> Self {
        self.derivation_depth = depth;
        self
    }

    pub fn is_committed(&self) -> bool {
        self.id.is_some()
    }

    pub fn is_derived(&self) -> bool {
        self.derivation_depth > 0
    }

    /// 时间几何或语义类型任一为发生型即视为发生型观测
    pub fn is_occurrent(&self) -> bool {
        self.geometry.is_occurrent() || self.observable.semantic_type.is_occurrent()
    }
}

/// 调度器请求的派生观测（通过 scope 重新进入解析流程）
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ObservationRequest {
    pub urn: String,
    pub geometry: Geometry,
    /// 触发派生的观测
    pub parent: Option<ObservationId>,
    pub derivation_depth: u32,
}
