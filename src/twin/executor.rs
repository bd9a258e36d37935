//! 执行器注册表：观测 id → 执行器
//!
//! 执行器收到（几何、事件、scope），返回该观测是否发生了变化；变化决定是否向受影响观测（AFFECTS）继续传播。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::event::Event;
use super::observation::{Geometry, ObservationId, ObservationRequest};

/// 执行器回调用的 scope：请求派生观测、上报错误
pub trait TwinScope: Send + Sync {
    fn request_observation(&self, request: ObservationRequest);
    fn error(&self, message: &str);
}

/// 未绑定 Agent 的 scope，只记录日志
#[derive(Debug, Default)]
pub struct DetachedScope;

impl TwinScope for DetachedScope {
    fn request_observation(&self, request: ObservationRequest) {
        tracing::warn!(urn = %request.urn, "observation request dropped: twin not bound to a context");
    }

    fn error(&self, message: &str) {
        tracing::error!(error = %message, "twin error (detached)");
    }
}

pub trait Executor: Send + Sync {
    /// 返回 true 表示观测发生了变化
    fn execute(&self, geometry: &Geometry, event: &Event, scope: &dyn TwinScope) -> bool;
}

impl<F> Executor for F
where
    F: Fn(&Geometry, &Event, &dyn TwinScope) -> bool + Send + Sync,
{
    fn execute(&self, geometry: &Geometry, event: &Event, scope: &dyn TwinScope) -> bool {
        self(geometry, event, scope)
    }
}

#[derive(Default)]
pub struct ExecutorTable {
    entries: HashMap<ObservationId, Arc<dyn Executor>>,
}

impl ExecutorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册或整体替换观测的执行器
    pub fn register(&mut self, id: ObservationId, executor: Arc<dyn Executor>) -> bool {
        self.entries.insert(id, executor).is_some()
    }

    pub fn get(&self, id: ObservationId) -> Option<Arc<dyn Executor>> {
        self.entries.get(&id).cloned()
    }

    pub fn contains(&self, id: ObservationId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl fmt::Debug for ExecutorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorTable")
            .field("observations", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twin::time::{TimeExtent, TimeInstant};

    #[test]
    fn test_register_replaces() {
        let mut table = ExecutorTable::new();
        let id = ObservationId(1);
        assert!(!table.register(id, Arc::new(|_: &Geometry, _: &Event, _: &dyn TwinScope| false)));
        assert!(table.register(id, Arc::new(|_: &Geometry, _: &Event, _: &dyn TwinScope| true)));
        assert_eq!(table.len(), 1);

        let event = Event::initialization(TimeExtent::point(TimeInstant::from_millis(0)));
        let executor = table.get(id).unwrap();
        assert!(executor.execute(&Geometry::empty(), &event, &DetachedScope));
    }
}
