//! 调度器投递给执行器的事件

use serde::Serialize;

use super::observation::Observation;
use super::time::{TimeExtent, TimeInstant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// 观测首次提交时的初始化
    Initialization,
    /// 时间网格上的一步
    TemporalTransition,
    /// 事件型观测被解析
    Event,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Event {
    pub event_type: EventType,
    /// 事件覆盖的时间段，永不为空
    pub time: TimeExtent,
    /// 仅 EVENT 类型携带：被解析的事件型观测
    pub observation: Option<Observation>,
}

impl Event {
    pub fn initialization(time: TimeExtent) -> Self {
        Self {
            event_type: EventType::Initialization,
            time,
            observation: None,
        }
    }

    /// [start, end) 上的时间迁移事件
    pub fn transition(start: TimeInstant, end: TimeInstant) -> Self {
        Self {
            event_type: EventType::TemporalTransition,
            time: TimeExtent::period(start, end),
            observation: None,
        }
    }

    pub fn occurrence(observation: Observation, time: TimeExtent) -> Self {
        Self {
            event_type: EventType::Event,
            time,
            observation: Some(observation),
        }
    }

    pub fn start(&self) -> TimeInstant {
        self.time.start
    }
}
