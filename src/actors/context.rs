//! 上下文 Agent：持有一个数字孪生，解析观测请求并驱动其调度器
//!
//! Observe 流程：Started（可重复）→ URN 分类 → reasoner → resolver → runtime（提交并 submit）
//! → 终态 Finished / Empty / Aborted（只发一次）。失败经 scope.error 上报并转为 Aborted；
//! 调度器契约违规除外，继续向上 panic，由 mailbox 循环停止 Agent。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::agent::{Agent, AgentContext};
use super::message::{AgentMessage, CoreMessage, Message, MessageId, MessageKind, Response};
use super::scope::{ContextScope, ObservationStatus, Scope, ScopeEvent};
use crate::core::{AgentError, ContractViolation, ServiceError};
use crate::services::UrnKind;
use crate::twin::{DigitalTwin, Geometry, Observation, ObservationId, ObservationRequest, TimeInstant};

/// 派生观测的来源
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Derivation {
    pub parent: Option<ObservationId>,
    pub depth: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Observe {
    pub urn: String,
    /// 覆盖上下文几何
    pub geometry: Option<Geometry>,
    pub derivation: Option<Derivation>,
}

impl Observe {
    pub fn new(urn: impl Into<String>) -> Self {
        Self {
            urn: urn.into(),
            geometry: None,
            derivation: None,
        }
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }
}

impl From<ObservationRequest> for Observe {
    fn from(request: ObservationRequest) -> Self {
        Self {
            urn: request.urn,
            geometry: Some(request.geometry),
            derivation: Some(Derivation {
                parent: request.parent,
                depth: request.derivation_depth,
            }),
        }
    }
}

/// Observe 的终态结果（ask 时作为回复）
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ObserveOutcome {
    pub urn: String,
    pub status: ObservationStatus,
    pub observation: Option<Observation>,
    pub error: Option<String>,
}

impl ObserveOutcome {
    pub fn empty() -> Self {
        Self {
            urn: String::new(),
            status: ObservationStatus::Empty,
            observation: None,
            error: None,
        }
    }

    fn with_status(urn: &str, status: ObservationStatus) -> Self {
        Self {
            urn: urn.to_string(),
            status,
            observation: None,
            error: None,
        }
    }

    fn finished(urn: &str, observation: Observation) -> Self {
        Self {
            urn: urn.to_string(),
            status: ObservationStatus::Finished,
            observation: Some(observation),
            error: None,
        }
    }

    fn aborted(urn: &str, error: String) -> Self {
        Self {
            urn: urn.to_string(),
            status: ObservationStatus::Aborted,
            observation: None,
            error: Some(error),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status == ObservationStatus::Finished
    }
}

#[derive(Debug)]
pub enum ContextMessage {
    Core(CoreMessage),
    /// 用给定的数字孪生替换当前孪生（旧孪生被 dispose）
    InitializeObservationContext(Box<DigitalTwin>),
    Observe(Observe),
    /// 推进调度器时间，投递所有已到期的时间迁移
    AdvanceTime(TimeInstant),
    DescribeTwin,
}

impl MessageKind for ContextMessage {
    fn tag(&self) -> &'static str {
        match self {
            ContextMessage::Core(core) => core.tag(),
            ContextMessage::InitializeObservationContext(_) => "InitializeObservationContext",
            ContextMessage::Observe(_) => "Observe",
            ContextMessage::AdvanceTime(_) => "AdvanceTime",
            ContextMessage::DescribeTwin => "DescribeTwin",
        }
    }
}

impl From<CoreMessage> for ContextMessage {
    fn from(core: CoreMessage) -> Self {
        ContextMessage::Core(core)
    }
}

impl AgentMessage for ContextMessage {
    fn into_core(self) -> Result<CoreMessage, Self> {
        match self {
            ContextMessage::Core(core) => Ok(core),
            other => Err(other),
        }
    }
}

pub struct ContextAgent {
    scope: ContextScope,
    twin: Option<DigitalTwin>,
}

impl ContextAgent {
    pub fn new(scope: ContextScope) -> Self {
        Self { scope, twin: None }
    }

    fn adopt(&mut self, mut twin: DigitalTwin) {
        if let Some(mut previous) = self.twin.take() {
            previous.dispose();
        }
        twin.bind_scope(Arc::new(self.scope.clone()));
        info!(context = %self.scope.name(), twin = %twin.id(), "digital twin bound");
        self.twin = Some(twin);
    }

    fn notify(&self, request: MessageId, outcome: &ObserveOutcome) {
        let event = ScopeEvent::Status {
            scope: self.scope.name().to_string(),
            urn: outcome.urn.clone(),
            status: outcome.status,
            observation: outcome.observation.clone(),
            error: outcome.error.clone(),
        };
        let message = Message::response_to(request, event);
        if outcome.status == ObservationStatus::Started {
            self.scope.send(message.repeatable());
        } else {
            self.scope.send(message);
        }
    }

    async fn observe(&mut self, request: MessageId, observe: Observe) -> ObserveOutcome {
        let urn = observe.urn.clone();
        self.notify(request, &ObserveOutcome::with_status(&urn, ObservationStatus::Started));

        let scope = self.scope.for_observation(observe.geometry, observe.derivation);
        let outcome = match AssertUnwindSafe(self.resolve(&scope, &urn)).catch_unwind().await {
            Ok(Ok(Some(observation))) => ObserveOutcome::finished(&urn, observation),
            Ok(Ok(None)) => ObserveOutcome::with_status(&urn, ObservationStatus::Empty),
            Ok(Err(e)) => {
                Scope::error(&self.scope, &e.to_string());
                ObserveOutcome::aborted(&urn, e.to_string())
            }
            Err(panic) if panic.is::<ContractViolation>() => std::panic::resume_unwind(panic),
            Err(_) => {
                let message = format!("observation of {} panicked", urn);
                Scope::error(&self.scope, &message);
                ObserveOutcome::aborted(&urn, message)
            }
        };
        debug!(context = %self.scope.name(), urn = %urn, status = ?outcome.status, "observation finished");
        self.notify(request, &outcome);
        outcome
    }

    async fn resolve(&mut self, scope: &ContextScope, urn: &str) -> Result<Option<Observation>, AgentError> {
        let kind = UrnKind::classify(urn);
        if kind != UrnKind::Observable {
            debug!(urn, kind = ?kind, "urn is not an observable");
            return Err(ServiceError::UnresolvableUrn(urn.to_string()).into());
        }
        let services = scope.services().clone();
        let Some(knowledge) = services.reasoner.resolve_knowledge(urn).await? else {
            return Err(ServiceError::UnresolvableUrn(urn.to_string()).into());
        };
        let dataflow = services.resolver.resolve(&knowledge, scope).await?;
        if dataflow.is_empty() {
            return Ok(None);
        }
        let twin = self
            .twin
            .as_mut()
            .ok_or_else(|| AgentError::NoDigitalTwin(self.scope.name().to_string()))?;
        let observation = services.runtime.run(&dataflow, twin, scope).await?;
        Ok(Some(observation))
    }

    fn twin_mut(&mut self) -> Result<&mut DigitalTwin, AgentError> {
        let name = self.scope.name().to_string();
        self.twin.as_mut().ok_or(AgentError::NoDigitalTwin(name))
    }
}

#[async_trait]
impl Agent for ContextAgent {
    type Message = ContextMessage;

    fn base_name(&self) -> &str {
        self.scope.name()
    }

    fn scope(&self) -> &dyn Scope {
        &self.scope
    }

    async fn initialize(&mut self, ctx: &mut AgentContext<ContextMessage>) -> Result<(), AgentError> {
        self.scope.bind(ctx.self_ref().clone());
        self.adopt(DigitalTwin::new(ctx.settings().scheduler.clone()));
        Ok(())
    }

    async fn handle_message(
        &mut self,
        ctx: &mut AgentContext<ContextMessage>,
        message: Message<ContextMessage>,
    ) -> Result<(), AgentError> {
        let request = message.id();
        match message.into_payload() {
            ContextMessage::InitializeObservationContext(twin) => {
                self.adopt(*twin);
                ctx.reply(Response::Ack);
            }
            ContextMessage::Observe(observe) => {
                let outcome = self.observe(request, observe).await;
                ctx.reply(Response::Observation(outcome));
            }
            ContextMessage::AdvanceTime(t) => {
                let delivered = self.twin_mut()?.advance_to(t)?;
                debug!(context = %ctx.name(), now = %t, delivered, "time advanced");
                ctx.reply(Response::Ack);
            }
            ContextMessage::DescribeTwin => {
                let summary = self.twin_mut()?.summary();
                ctx.reply(Response::Twin(summary));
            }
            ContextMessage::Core(core) => return Err(AgentError::UnexpectedMessage(core.tag())),
        }
        Ok(())
    }

    async fn stop(&mut self, _ctx: &mut AgentContext<ContextMessage>) {
        if let Some(mut twin) = self.twin.take() {
            twin.dispose();
        }
    }
}
