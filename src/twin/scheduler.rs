//! 调度器：纪元跟踪、分辨率细化、时间迁移回放与执行器分发
//!
//! 每个数字孪生一个调度器，只在所属上下文 Agent 的任务内被调用，因此不加锁。
//! 同一时刻内的投递顺序：步长较粗者优先，其次按注册顺序；结构子观测在父观测之后随级联投递。

use std::cmp::Reverse;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::event::{Event, EventType};
use super::executor::{DetachedScope, Executor, ExecutorTable, TwinScope};
use super::knowledge_graph::{Activity, KnowledgeGraph};
use super::observation::{Observation, ObservationId, ObservationRequest, SemanticType};
use super::time::{Resolution, TimeExtent, TimeInstant};
use crate::config::SchedulerSection;
use crate::core::ContractViolation;

/// 发生型观测在时间网格上的注册
#[derive(Clone, Debug)]
pub struct Registration {
    pub observation: ObservationId,
    pub extent: TimeExtent,
    sequence: u64,
    next_index: u64,
}

impl Registration {
    fn step_millis(&self) -> i64 {
        self.extent.step.map(|s| s.span_millis()).unwrap_or(i64::MAX)
    }

    fn next_boundary(&self) -> Option<TimeInstant> {
        self.extent.boundary(self.next_index)
    }

    fn order_key(&self, at: TimeInstant) -> (TimeInstant, Reverse<i64>, u64) {
        (at, Reverse(self.step_millis()), self.sequence)
    }

    /// 取出下一步的迁移事件并前移游标
    fn take_transition(&mut self) -> Option<Event> {
        let period = self.extent.step_period(self.next_index)?;
        self.next_index += 1;
        Some(Event::transition(period.start, period.end))
    }

    pub fn pending(&self) -> Vec<TimeInstant> {
        (self.next_index..self.extent.steps())
            .filter_map(|i| self.extent.boundary(i))
            .collect()
    }
}

#[derive(Clone, Debug)]
struct RootEntry {
    id: ObservationId,
    time: Option<TimeExtent>,
}

pub struct Scheduler {
    config: SchedulerSection,
    epoch_start: Option<TimeInstant>,
    epoch_end: Option<TimeInstant>,
    resolution_millis: Option<i64>,
    grid_anchor: Option<TimeInstant>,
    current_time: Option<TimeInstant>,
    executors: ExecutorTable,
    registrations: Vec<Registration>,
    roots: Vec<RootEntry>,
    submitted: HashSet<ObservationId>,
    derivations: HashSet<(ObservationId, String)>,
    scope: Arc<dyn TwinScope>,
    next_sequence: u64,
    delivered: u64,
}

impl Scheduler {
    pub fn new(config: SchedulerSection) -> Self {
        Self {
            config,
            epoch_start: None,
            epoch_end: None,
            resolution_millis: None,
            grid_anchor: None,
            current_time: None,
            executors: ExecutorTable::new(),
            registrations: Vec::new(),
            roots: Vec::new(),
            submitted: HashSet::new(),
            derivations: HashSet::new(),
            scope: Arc::new(DetachedScope),
            next_sequence: 0,
            delivered: 0,
        }
    }

    /// 绑定执行器回调与派生请求使用的 scope
    pub fn bind_scope(&mut self, scope: Arc<dyn TwinScope>) {
        self.scope = scope;
    }

    /// [start, end) 上的 TEMPORAL_TRANSITION 事件
    pub fn event(start: TimeInstant, end: TimeInstant) -> Event {
        Event::transition(start, end)
    }

    pub fn register_executor(&mut self, id: ObservationId, executor: Arc<dyn Executor>) {
        if self.executors.register(id, executor) {
            debug!(observation = %id, "executor replaced");
        }
    }

    pub fn epoch_start(&self) -> Option<TimeInstant> {
        self.epoch_start
    }

    pub fn epoch_end(&self) -> Option<TimeInstant> {
        self.epoch_end
    }

    /// 当前跟踪的最细分辨率
    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution_millis.map(Resolution::of_millis)
    }

    pub fn current_time(&self) -> Option<TimeInstant> {
        self.current_time
    }

    pub fn is_submitted(&self, id: ObservationId) -> bool {
        self.submitted.contains(&id)
    }

    pub fn registration(&self, id: ObservationId) -> Option<&Registration> {
        self.registrations.iter().find(|r| r.observation == id)
    }

    /// 观测尚未投递的迁移边界
    pub fn pending_transitions(&self, id: ObservationId) -> Vec<TimeInstant> {
        self.registration(id).map(Registration::pending).unwrap_or_default()
    }

    /// 执行器累计被调用的次数
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// 提交已 commit 的根观测
    ///
    /// 依次：扩展纪元、细化分辨率、注册时间网格、投递 INITIALIZATION、
    /// 回放已过去的迁移、广播事件型观测、请求派生观测。
    ///
    /// # Panics
    /// 观测未提交到 graph、不是根观测或被重复提交时以 [`ContractViolation`] 为载荷 panic。
    pub fn submit(&mut self, graph: &KnowledgeGraph, observation: &Observation, activity: &Activity) {
        let id = match observation.id {
            Some(id) if graph.contains(id) => id,
            _ => violated(format!("observation '{}' submitted before commit", observation.name)),
        };
        if graph.parent(id).is_some() {
            violated(format!("{} is not a root observation", id));
        }
        if !self.submitted.insert(id) {
            violated(format!("{} submitted twice", id));
        }
        info!(observation = %id, urn = %observation.observable, activity = activity.id, "submitting observation");

        let time = observation.geometry.time;
        if let Some(t) = time {
            self.widen(t.start, t.end);
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let registered = match self.grid_for(observation) {
            Some(extent) => {
                self.refine(&extent);
                self.registrations.push(Registration {
                    observation: id,
                    extent,
                    sequence,
                    next_index: 0,
                });
                debug!(observation = %id, steps = extent.steps(), "registered for temporal transitions");
                Some(self.registrations.len() - 1)
            }
            None => None,
        };
        self.roots.push(RootEntry { id, time });

        let init_time = time.unwrap_or_else(|| {
            TimeExtent::point(self.current_time.or(self.epoch_start).unwrap_or_else(TimeInstant::now))
        });
        self.dispatch(graph, id, &Event::initialization(init_time));

        if let (Some(index), Some(now)) = (registered, self.current_time) {
            let replayed = self.replay(graph, index, now);
            if replayed > 0 {
                debug!(observation = %id, replayed, until = %now, "replayed elapsed transitions");
            }
        }

        if observation.observable.semantic_type == SemanticType::Event {
            self.broadcast_occurrence(graph, id, observation, init_time);
        }

        self.request_derivations(id, observation);
    }

    /// 投递所有边界 ≤ t 的待处理迁移（全局时间序），并把当前时间推进到 t
    pub fn advance_to(&mut self, graph: &KnowledgeGraph, t: TimeInstant) -> usize {
        if let Some(now) = self.current_time {
            if t < now {
                warn!(requested = %t, current = %now, "time cannot move backwards, ignoring");
                return 0;
            }
        }

        let mut delivered = 0;
        loop {
            let next = self
                .registrations
                .iter()
                .enumerate()
                .filter_map(|(i, r)| {
                    r.next_boundary()
                        .filter(|b| *b <= t)
                        .map(|b| (r.order_key(b), i))
                })
                .min();
            let Some((_, index)) = next else { break };
            let registration = &mut self.registrations[index];
            let id = registration.observation;
            let Some(event) = registration.take_transition() else { break };
            self.dispatch(graph, id, &event);
            delivered += 1;
        }

        self.current_time = Some(t);
        debug!(now = %t, delivered, "scheduler time advanced");
        delivered
    }

    /// 清空全部调度状态（数字孪生 dispose 时调用）
    pub fn reset(&mut self) {
        let scope = self.scope.clone();
        *self = Scheduler::new(self.config.clone());
        self.scope = scope;
    }

    fn widen(&mut self, start: TimeInstant, end: TimeInstant) {
        self.epoch_start = Some(self.epoch_start.map_or(start, |s| s.min(start)));
        self.epoch_end = Some(self.epoch_end.map_or(end, |e| e.max(end)));
    }

    /// 分辨率取所有步长与网格偏移的最大公约数，只会变细
    fn refine(&mut self, extent: &TimeExtent) {
        let Some(step) = extent.step else { return };
        let anchor = *self.grid_anchor.get_or_insert(extent.start);
        let offset = i64::try_from(extent.start.millis().abs_diff(anchor.millis())).unwrap_or(i64::MAX);
        let mut millis = gcd(step.span_millis(), offset);
        if let Some(current) = self.resolution_millis {
            millis = gcd(current, millis);
        }
        if self.resolution_millis != Some(millis) {
            info!(resolution = %Resolution::of_millis(millis), "temporal resolution refined");
            self.resolution_millis = Some(millis);
        }
    }

    fn grid_for(&self, observation: &Observation) -> Option<TimeExtent> {
        if !observation.is_occurrent() {
            return None;
        }
        let time = observation.geometry.time?;
        let extent = match time.step {
            Some(_) => time,
            None => TimeExtent::grid(time.start, time.end, Resolution::of_millis(self.resolution_millis?)),
        };
        (extent.steps() > 0).then_some(extent)
    }

    fn replay(&mut self, graph: &KnowledgeGraph, index: usize, now: TimeInstant) -> usize {
        let mut replayed = 0;
        loop {
            let registration = &mut self.registrations[index];
            match registration.next_boundary() {
                Some(boundary) if boundary <= now => {}
                _ => break,
            }
            let id = registration.observation;
            let Some(event) = registration.take_transition() else { break };
            self.dispatch(graph, id, &event);
            replayed += 1;
        }
        replayed
    }

    /// 从 root 开始投递，父先于子
    ///
    /// 时间与事件相交（或没有时间）的结构子观测总会收到事件，初始化无条件传播；
    /// 只有执行器报告变化时才继续传播给 AFFECTS 目标。
    fn dispatch(&mut self, graph: &KnowledgeGraph, root: ObservationId, event: &Event) {
        let initializing = event.event_type == EventType::Initialization;
        let mut queue = VecDeque::from([root]);
        let mut visited = HashSet::new();

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let Some(observation) = graph.get(id) else { continue };
            let changed = match self.executors.get(id) {
                Some(executor) => {
                    self.delivered += 1;
                    executor.execute(&observation.geometry, event, self.scope.as_ref())
                }
                None => {
                    debug!(observation = %id, "no executor registered");
                    false
                }
            };
            queue.extend(graph.children(id).iter().copied().filter(|child| {
                initializing
                    || graph
                        .get(*child)
                        .and_then(|c| c.geometry.time)
                        .map_or(true, |t| t.intersects(&event.time))
            }));
            if changed {
                queue.extend(graph.affected_by(id).iter().filter(|t| !visited.contains(*t)).copied());
            }
        }
    }

    fn broadcast_occurrence(&mut self, graph: &KnowledgeGraph, id: ObservationId, observation: &Observation, time: TimeExtent) {
        let targets: Vec<ObservationId> = self
            .roots
            .iter()
            .filter(|r| r.id != id)
            .filter(|r| r.time.map(|t| t.contains(time.start)).unwrap_or(false))
            .map(|r| r.id)
            .collect();
        if targets.is_empty() {
            return;
        }
        let mut committed = observation.clone();
        committed.id = Some(id);
        let event = Event::occurrence(committed, time);
        debug!(observation = %id, targets = targets.len(), "broadcasting event occurrence");
        for target in targets {
            self.dispatch(graph, target, &event);
        }
    }

    /// 随时间变化的非派生质量观测请求一次 "change in X"
    fn request_derivations(&mut self, id: ObservationId, observation: &Observation) {
        if !self.config.derive_change_observables || observation.is_derived() {
            return;
        }
        if observation.observable.semantic_type != SemanticType::Quality || !observation.geometry.is_occurrent() {
            return;
        }
        let depth = observation.derivation_depth + 1;
        if depth > self.config.max_derivation_depth {
            return;
        }
        let change = observation.observable.change_in();
        if !self.derivations.insert((id, change.urn.clone())) {
            return;
        }
        debug!(observation = %id, derived = %change, "requesting derived observation");
        self.scope.request_observation(ObservationRequest {
            urn: change.urn,
            geometry: observation.geometry.clone(),
            parent: Some(id),
            derivation_depth: depth,
        });
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("epoch_start", &self.epoch_start)
            .field("epoch_end", &self.epoch_end)
            .field("resolution", &self.resolution())
            .field("current_time", &self.current_time)
            .field("registrations", &self.registrations.len())
            .field("executors", &self.executors)
            .finish()
    }
}

fn violated(message: String) -> ! {
    error!(%message, "scheduler contract violated");
    std::panic::panic_any(ContractViolation(message))
}

fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.unsigned_abs(), b.unsigned_abs());
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    i64::try_from(a).unwrap_or(i64::MAX)
}
