//! Orchestration engine
//!
//! Subscribes to inbound text, asks the reasoner what to do, runs the
//! requested tool calls through the [`ToolRegistry`], and publishes exactly
//! one response per inbound envelope.
//!
//! Each origin gets its own worker task. A worker handles one envelope at a
//! time, so a second message from the same input is only forwarded to the
//! reasoner after the first one's response is on the bus. Different origins
//! proceed concurrently.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt, stream};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{ControlKind, Envelope, EnvelopeKind, LifecycleKind, MessageBus, Subscription};
use crate::config::EngineConfig;
use crate::error::panic_message;
use crate::reasoning::{ConversationContext, Decision, Exchange, Reasoner, Step};
use crate::tools::{DispatchPriority, ToolCallRequest, ToolCallResult, ToolRegistry};
use crate::{Error, Result};

/// Origin of envelopes produced by the engine
pub const ENGINE_ORIGIN: &str = "engine";

/// Subscriber name of the engine on the bus
const SUBSCRIBER: &str = "engine";

/// Per-conversation processing state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    AwaitingDecision,
    Dispatching,
    Responding,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::AwaitingDecision => write!(f, "awaiting_decision"),
            Self::Dispatching => write!(f, "dispatching"),
            Self::Responding => write!(f, "responding"),
        }
    }
}

/// A state change of one origin's conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub origin: String,
    /// Inbound envelope being handled
    pub correlation_id: Uuid,
    pub from: EngineState,
    pub to: EngineState,
}

/// Routes inbound envelopes to per-origin workers
pub struct Engine {
    bus: MessageBus,
    tools: Arc<ToolRegistry>,
    reasoner: Arc<dyn Reasoner>,
    config: EngineConfig,
    transitions: broadcast::Sender<StateTransition>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("reasoner", &self.reasoner.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    #[must_use]
    pub fn new(
        bus: MessageBus,
        tools: Arc<ToolRegistry>,
        reasoner: Arc<dyn Reasoner>,
        config: EngineConfig,
    ) -> Self {
        let (transitions, _) = broadcast::channel(256);
        Self {
            bus,
            tools,
            reasoner,
            config,
            transitions,
        }
    }

    /// Watch state transitions of every conversation
    #[must_use]
    pub fn transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// Subscribe to the bus and start routing
    ///
    /// The subscription exists when this returns, so nothing published
    /// afterwards is missed.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateName` if an engine is already subscribed
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let subscription = self.bus.subscribe(SUBSCRIBER, |e: &Envelope| {
            matches!(
                e.kind,
                EnvelopeKind::InboundText | EnvelopeKind::Control(ControlKind::Ping)
            )
        })?;
        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move {
            engine.route(subscription, shutdown).await;
        }))
    }

    async fn route(self: Arc<Self>, mut subscription: Subscription, shutdown: CancellationToken) {
        let mut workers: HashMap<String, mpsc::Sender<Arc<Envelope>>> = HashMap::new();
        let mut tasks = JoinSet::new();
        let queue_depth = self.bus.capacity();

        tracing::info!(reasoner = self.reasoner.name(), "engine started");

        loop {
            let envelope = tokio::select! {
                () = shutdown.cancelled() => break,
                envelope = subscription.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            if envelope.kind == EnvelopeKind::Control(ControlKind::Ping) {
                let mut pong = Envelope::control(ENGINE_ORIGIN, ControlKind::Pong);
                pong.correlation_id = Some(envelope.id);
                pong.target = Some(envelope.origin.clone());
                self.bus.publish(pong);
                continue;
            }

            let sender = workers.entry(envelope.origin.clone()).or_insert_with(|| {
                self.spawn_worker(&mut tasks, &envelope.origin, queue_depth, &shutdown)
            });

            match sender.try_send(Arc::clone(&envelope)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        origin = %envelope.origin,
                        "engine worker queue full, dropping message"
                    );
                    self.bus.publish(Envelope::lifecycle(
                        ENGINE_ORIGIN,
                        LifecycleKind::BackpressureDrop,
                        Some(format!("engine worker {} dropped a message", envelope.origin)),
                    ));
                }
                Err(TrySendError::Closed(envelope)) => {
                    tracing::error!(origin = %envelope.origin, "engine worker died, restarting it");
                    self.bus.publish(Envelope::lifecycle(
                        ENGINE_ORIGIN,
                        LifecycleKind::Error,
                        Some(format!("engine worker {} died and was restarted", envelope.origin)),
                    ));
                    let replacement =
                        self.spawn_worker(&mut tasks, &envelope.origin, queue_depth, &shutdown);
                    // A fresh queue has room
                    let _ = replacement.try_send(Arc::clone(&envelope));
                    workers.insert(envelope.origin.clone(), replacement);
                }
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "engine worker failed");
                }
            }
        }

        drop(workers);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "engine worker failed");
            }
        }
        tracing::info!("engine stopped");
    }

    fn spawn_worker(
        self: &Arc<Self>,
        tasks: &mut JoinSet<()>,
        origin: &str,
        queue_depth: usize,
        shutdown: &CancellationToken,
    ) -> mpsc::Sender<Arc<Envelope>> {
        let (tx, rx) = mpsc::channel(queue_depth);
        let engine = Arc::clone(self);
        let origin = origin.to_string();
        let shutdown = shutdown.clone();
        tasks.spawn(async move { engine.work(origin, rx, shutdown).await });
        tx
    }

    /// Handle one origin's envelopes, strictly in order
    async fn work(
        &self,
        origin: String,
        mut rx: mpsc::Receiver<Arc<Envelope>>,
        shutdown: CancellationToken,
    ) {
        let mut history = VecDeque::new();
        tracing::debug!(origin = %origin, "engine worker started");

        loop {
            let envelope = tokio::select! {
                () = shutdown.cancelled() => break,
                envelope = rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let response = tokio::select! {
                () = shutdown.cancelled() => break,
                response = self.handle(&envelope, &mut history) => response,
            };
            self.bus.publish(response);
            self.transition(&envelope, EngineState::Responding, EngineState::Idle);
        }
        tracing::debug!(origin = %origin, "engine worker stopped");
    }

    /// Process one inbound envelope and build its response
    ///
    /// Leaves the conversation in `Responding`; the caller publishes and
    /// moves it back to `Idle`.
    pub async fn handle(&self, inbound: &Envelope, history: &mut VecDeque<Exchange>) -> Envelope {
        let input = inbound.payload.text().unwrap_or_default().trim().to_string();
        tracing::info!(origin = %inbound.origin, input = %input, "handling inbound message");

        let mut context = ConversationContext::new(
            inbound.origin.clone(),
            history.iter().cloned().collect(),
            self.tools.definitions().await,
        );

        self.transition(inbound, EngineState::Idle, EngineState::AwaitingDecision);
        let answer = self.reason(inbound, &input, &mut context).await;
        self.transition(inbound, EngineState::AwaitingDecision, EngineState::Responding);

        history.push_back(Exchange {
            user: input,
            assistant: answer.clone(),
        });
        while history.len() > self.config.history_limit {
            history.pop_front();
        }

        let results: Vec<ToolCallResult> = context.results().cloned().collect();
        Envelope::response(ENGINE_ORIGIN, inbound, answer, results)
    }

    /// Consult the reasoner until it answers or iterations run out
    async fn reason(
        &self,
        inbound: &Envelope,
        input: &str,
        context: &mut ConversationContext,
    ) -> String {
        for iteration in 0..self.config.max_iterations {
            let decide = AssertUnwindSafe(self.reasoner.decide(input, context))
                .catch_unwind()
                .map(|caught| {
                    caught.unwrap_or_else(|payload| {
                        Err(Error::Reasoning(format!(
                            "{} panicked: {}",
                            self.reasoner.name(),
                            panic_message(payload.as_ref())
                        )))
                    })
                });
            let decision = tokio::time::timeout(self.config.decision_timeout, decide)
                .await
                .unwrap_or(Err(Error::ReasoningTimeout(self.config.decision_timeout)));

            match decision {
                Ok(Decision::FinalAnswer(text)) if !text.trim().is_empty() => return text,
                Ok(Decision::FinalAnswer(_)) => return summarize(context),
                Ok(Decision::ToolCalls(calls)) if calls.is_empty() => return summarize(context),
                Ok(Decision::ToolCalls(mut calls)) => {
                    for (i, call) in calls.iter_mut().enumerate() {
                        if call.call_id.is_none() {
                            call.call_id = Some(format!("call_{iteration}_{i}"));
                        }
                    }

                    self.transition(inbound, EngineState::AwaitingDecision, EngineState::Dispatching);
                    let results = self.dispatch_all(&calls).await;
                    context.steps.push(Step { calls, results });
                    self.transition(inbound, EngineState::Dispatching, EngineState::AwaitingDecision);
                }
                Err(e) => {
                    tracing::warn!(origin = %inbound.origin, error = %e, "reasoning failed");
                    return format!("Sorry, I could not process that request ({e}).");
                }
            }
        }

        tracing::warn!(
            origin = %inbound.origin,
            max_iterations = self.config.max_iterations,
            "reasoning iterations exhausted"
        );
        summarize(context)
    }

    /// Run one decision's tool calls
    ///
    /// Time-critical calls go first, one at a time. Normal calls then run with
    /// bounded parallelism. Results come back in request order.
    pub async fn dispatch_all(&self, calls: &[ToolCallRequest]) -> Vec<ToolCallResult> {
        let mut critical = Vec::new();
        let mut normal = Vec::new();
        for (i, call) in calls.iter().enumerate() {
            match self.tools.priority_of(&call.tool_name).await {
                Some(DispatchPriority::TimeCritical) => critical.push(i),
                _ => normal.push(i),
            }
        }

        let mut results: Vec<Option<ToolCallResult>> = vec![None; calls.len()];
        for i in critical {
            results[i] = Some(self.tools.dispatch(&calls[i]).await);
        }

        let finished: Vec<(usize, ToolCallResult)> = stream::iter(normal)
            .map(|i| async move { (i, self.tools.dispatch(&calls[i]).await) })
            .buffered(self.config.max_parallel_tools.max(1))
            .collect()
            .await;
        for (i, result) in finished {
            results[i] = Some(result);
        }

        results.into_iter().flatten().collect()
    }

    fn transition(&self, inbound: &Envelope, from: EngineState, to: EngineState) {
        tracing::debug!(origin = %inbound.origin, %from, %to, "engine state");
        // No receivers is fine
        let _ = self.transitions.send(StateTransition {
            origin: inbound.origin.clone(),
            correlation_id: inbound.id,
            from,
            to,
        });
    }
}

/// Response text built from tool results alone
fn summarize(context: &ConversationContext) -> String {
    let lines: Vec<String> = context
        .results()
        .map(|r| {
            if r.success {
                r.message.clone()
            } else {
                format!("{} failed: {}", r.tool_name, r.message)
            }
        })
        .collect();

    if lines.is_empty() {
        "Sorry, I could not process that request.".to_string()
    } else {
        lines.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::tools::ToolOutput;

    #[test]
    fn test_summarize() {
        let ok = ToolCallRequest::new("lamp", Map::new());
        let bad = ToolCallRequest::new("amp", Map::new());
        let mut context = ConversationContext::default();
        context.steps.push(Step {
            calls: vec![ok.clone(), bad.clone()],
            results: vec![
                ToolCallResult::success(&ok, ToolOutput::message("lamp on")),
                ToolCallResult::failure(&bad, &Error::ToolExecution("unplugged".to_string())),
            ],
        });

        assert_eq!(
            summarize(&context),
            "lamp on; amp failed: tool execution failed: unplugged"
        );
    }

    #[test]
    fn test_summarize_nothing() {
        assert!(summarize(&ConversationContext::default()).starts_with("Sorry"));
    }
}
