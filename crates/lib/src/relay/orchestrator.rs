//! Relay orchestrator: the pipeline and concurrency core.
//!
//! Per event: `Received -> Normalized -> DedupChecked -> Completing -> Delivering -> Done`.
//! Normalization and dedup run synchronously in `submit`; accepted messages go onto a
//! queue keyed by conversation id. Each non-empty queue is drained by one task, so a
//! conversation's messages complete and deliver in arrival order, while a semaphore caps
//! how many messages are in flight across all conversations.

use crate::channels::{
    CanonicalMessage, DeliveryClient, DeliveryError, GupshupClient, InboundEvent,
    NormalizationError, OutboundMessage, SchemaMatcher,
};
use crate::config::Config;
use crate::llm::{self, CompletionClient, CompletionError, CompletionRequest};
use crate::relay::circuit::{CircuitBreaker, CircuitSettings};
use crate::relay::dedup::{Deduplicator, Outcome};
use crate::relay::retry::RetryPolicy;
use crate::relay::stats::{RelayStats, StatsSnapshot};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;

/// Orchestrator policy, resolved from config.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub workers: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown: Duration,
    pub dedup_retention: Duration,
    pub dedup_max_entries: usize,
    pub completion_timeout: Duration,
    pub delivery_timeout: Duration,
    pub fallback_reply: String,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Config::default().relay_settings()
    }
}

impl RelaySettings {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.backoff_base,
            max_delay: self.backoff_max,
        }
    }

    fn circuit_settings(&self) -> CircuitSettings {
        CircuitSettings {
            failure_threshold: self.circuit_failure_threshold,
            cooldown: self.circuit_cooldown,
        }
    }
}

/// Processing stage of one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Normalized,
    DedupChecked,
    Completing,
    Delivering,
    Done,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Normalized => "normalized",
            Stage::DedupChecked => "dedup-checked",
            Stage::Completing => "completing",
            Stage::Delivering => "delivering",
            Stage::Done => "done",
        }
    }
}

/// Why an event was acknowledged without processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    UnrecognizedSchema,
    EmptyText,
    Duplicate,
}

impl IgnoreReason {
    pub fn as_str(self) -> &'static str {
        match self {
            IgnoreReason::UnrecognizedSchema => "unrecognized-schema",
            IgnoreReason::EmptyText => "empty-text",
            IgnoreReason::Duplicate => "duplicate",
        }
    }
}

impl From<NormalizationError> for IgnoreReason {
    fn from(e: NormalizationError) -> Self {
        match e {
            NormalizationError::UnrecognizedSchema => IgnoreReason::UnrecognizedSchema,
            NormalizationError::EmptyText => IgnoreReason::EmptyText,
        }
    }
}

/// What went wrong for a `Failed` message, after retries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Failure {
    #[error("completion failed: {0}")]
    Completion(CompletionError),
    #[error("completion circuit open")]
    CompletionCircuitOpen,
    #[error("delivery failed: {0}")]
    Delivery(DeliveryError),
    #[error("delivery circuit open")]
    DeliveryCircuitOpen,
}

/// Terminal state of one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Success {
        message_id: String,
        reply: String,
    },
    /// `delivered_reply` is the fallback text when it still reached the user.
    Failed {
        message_id: String,
        failure: Failure,
        delivered_reply: Option<String>,
    },
    Ignored {
        message_id: Option<String>,
        reason: IgnoreReason,
    },
}

impl RelayOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RelayOutcome::Success { .. })
    }
}

/// The event was not processed and may be redelivered later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("relay is shutting down")]
    ShuttingDown,
    #[error("relay worker dropped the event")]
    Abandoned,
}

type OutcomeSender = oneshot::Sender<Result<RelayOutcome, SubmitError>>;

/// Accepted event; resolves once the message reaches a terminal state.
pub enum Submission {
    Done(RelayOutcome),
    Queued(oneshot::Receiver<Result<RelayOutcome, SubmitError>>),
}

impl Submission {
    pub async fn outcome(self) -> Result<RelayOutcome, SubmitError> {
        match self {
            Submission::Done(outcome) => Ok(outcome),
            Submission::Queued(rx) => rx.await.unwrap_or(Err(SubmitError::Abandoned)),
        }
    }
}

struct Job {
    message: CanonicalMessage,
    reply_tx: OutcomeSender,
}

/// Upstream step failure: refused by the circuit, or failed after retries.
enum StepError<E> {
    CircuitOpen,
    Failed(E),
}

trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for CompletionError {
    fn is_transient(&self) -> bool {
        CompletionError::is_transient(self)
    }
}

impl Transient for DeliveryError {
    fn is_transient(&self) -> bool {
        DeliveryError::is_transient(self)
    }
}

struct Inner {
    matcher: SchemaMatcher,
    dedup: Deduplicator,
    completion: Arc<dyn CompletionClient>,
    delivery: Arc<dyn DeliveryClient>,
    completion_circuit: CircuitBreaker,
    delivery_circuit: CircuitBreaker,
    retry: RetryPolicy,
    settings: RelaySettings,
    workers: Arc<Semaphore>,
    /// Conversation id -> queue of its pending messages.
    /// An entry exists exactly while a drain task runs.
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closing: AtomicBool,
    stats: RelayStats,
}

/// Accepts inbound events and drives them to a terminal state. Cheap to clone.
#[derive(Clone)]
pub struct RelayOrchestrator {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RelayOrchestrator {
    pub fn new(
        matcher: SchemaMatcher,
        completion: Arc<dyn CompletionClient>,
        delivery: Arc<dyn DeliveryClient>,
        settings: RelaySettings,
    ) -> Self {
        let completion_circuit = CircuitBreaker::new(
            format!("completion:{}", completion.name()),
            settings.circuit_settings(),
        );
        let delivery_circuit = CircuitBreaker::new(
            format!("delivery:{}", delivery.id()),
            settings.circuit_settings(),
        );
        let inner = Inner {
            matcher,
            dedup: Deduplicator::new(settings.dedup_retention, settings.dedup_max_entries),
            completion,
            delivery,
            completion_circuit,
            delivery_circuit,
            retry: settings.retry_policy(),
            workers: Arc::new(Semaphore::new(settings.workers.max(1))),
            settings,
            queues: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
            stats: RelayStats::default(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Build the configured completion and delivery clients and wire them up.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            SchemaMatcher::new(config.relay.schemas.clone()),
            llm::client_from_config(config),
            Arc::new(GupshupClient::from_config(config)),
            config.relay_settings(),
        )
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            completion_circuit_open: self.inner.completion_circuit.is_open(),
            delivery_circuit_open: self.inner.delivery_circuit.is_open(),
            ..self.inner.stats.snapshot(self.inner.dedup.len())
        }
    }

    pub fn dedup(&self) -> &Deduplicator {
        &self.inner.dedup
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Normalize and dedup-check `event`, then queue it behind earlier messages of the same
    /// conversation.
    /// Ignored events resolve immediately.
    pub fn submit(&self, event: InboundEvent) -> Result<Submission, SubmitError> {
        let inner = &self.inner;
        if self.is_closing() {
            inner.stats.rejected();
            return Err(SubmitError::ShuttingDown);
        }
        inner.stats.received();
        trace_stage(None, Stage::Received);

        let message = match inner.matcher.normalize(&event) {
            Ok(m) => m,
            Err(e) => {
                log::info!("relay: ignoring inbound event: {}", e.reason());
                inner.stats.ignored();
                return Ok(Submission::Done(RelayOutcome::Ignored {
                    message_id: None,
                    reason: e.into(),
                }));
            }
        };
        trace_stage(Some(&message.message_id), Stage::Normalized);

        if !inner.dedup.should_process(&message.message_id) {
            log::info!(
                "relay: duplicate message {} from {} ignored",
                message.message_id,
                message.conversation_id
            );
            inner.stats.duplicate();
            inner.stats.ignored();
            return Ok(Submission::Done(RelayOutcome::Ignored {
                message_id: Some(message.message_id),
                reason: IgnoreReason::Duplicate,
            }));
        }
        trace_stage(Some(&message.message_id), Stage::DedupChecked);

        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(Job { message, reply_tx })?;
        Ok(Submission::Queued(reply_rx))
    }

    /// Submit and wait for the terminal state.
    pub async fn handle(&self, event: InboundEvent) -> Result<RelayOutcome, SubmitError> {
        self.submit(event)?.outcome().await
    }

    fn enqueue(&self, job: Job) -> Result<(), SubmitError> {
        let inner = &self.inner;
        let mut queues = lock(&inner.queues);
        if inner.closing.load(Ordering::SeqCst) {
            inner.dedup.record_outcome(&job.message.message_id, Outcome::Failed);
            inner.stats.rejected();
            return Err(SubmitError::ShuttingDown);
        }
        let job = match queues.get(&job.message.conversation_id) {
            Some(tx) => match tx.send(job) {
                Ok(()) => return Ok(()),
                // Drain task is gone without deregistering; replace it.
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };
        self.spawn_drain(&mut queues, job)
    }

    fn spawn_drain(
        &self,
        queues: &mut HashMap<String, mpsc::UnboundedSender<Job>>,
        job: Job,
    ) -> Result<(), SubmitError> {
        let conversation_id = job.message.conversation_id.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(job).is_err() {
            return Err(SubmitError::Abandoned);
        }
        queues.insert(conversation_id.clone(), tx);
        let handle = tokio::spawn(drain_conversation(self.inner.clone(), conversation_id, rx));
        let mut tasks = lock(&self.inner.tasks);
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
        Ok(())
    }

    /// Stop accepting events. Queued events not yet started are rejected; in-flight ones finish.
    pub fn close(&self) {
        let _queues = lock(&self.inner.queues);
        if !self.inner.closing.swap(true, Ordering::SeqCst) {
            log::info!("relay: closing, rejecting queued events");
        }
    }

    /// Close and wait until every conversation queue has drained.
    pub async fn shutdown(&self) {
        self.close();
        let handles = std::mem::take(&mut *lock(&self.inner.tasks));
        futures_util::future::join_all(handles).await;
        log::info!("relay: all workers finished");
    }
}

fn trace_stage(message_id: Option<&str>, stage: Stage) {
    log::debug!("relay {}: {}", message_id.unwrap_or("-"), stage.as_str());
}

/// Process one conversation's queue in order; exits (and deregisters) once it is empty.
async fn drain_conversation(
    inner: Arc<Inner>,
    conversation_id: String,
    mut rx: mpsc::UnboundedReceiver<Job>,
) {
    loop {
        let job = {
            let mut queues = lock(&inner.queues);
            match rx.try_recv() {
                Ok(job) => job,
                Err(_) => {
                    queues.remove(&conversation_id);
                    return;
                }
            }
        };
        let Job { message, reply_tx } = job;
        if inner.closing.load(Ordering::SeqCst) {
            reject(&inner, &message, reply_tx);
            continue;
        }
        let permit = match inner.workers.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                reject(&inner, &message, reply_tx);
                continue;
            }
        };
        if inner.closing.load(Ordering::SeqCst) {
            drop(permit);
            reject(&inner, &message, reply_tx);
            continue;
        }
        let outcome = inner.process(&message).await;
        drop(permit);
        let _ = reply_tx.send(Ok(outcome));
    }
}

fn reject(inner: &Inner, message: &CanonicalMessage, reply_tx: OutcomeSender) {
    log::info!(
        "relay: rejecting queued message {} from {} (shutting down)",
        message.message_id,
        message.conversation_id
    );
    inner.dedup.record_outcome(&message.message_id, Outcome::Failed);
    inner.stats.rejected();
    let _ = reply_tx.send(Err(SubmitError::ShuttingDown));
}

impl Inner {
    /// Complete, deliver, record. Always ends in `Success` or `Failed`.
    async fn process(&self, message: &CanonicalMessage) -> RelayOutcome {
        trace_stage(Some(&message.message_id), Stage::Completing);
        let request = &CompletionRequest::new(message.text.clone());
        let completion = self.completion.as_ref();
        let timeout = self.settings.completion_timeout;
        let completed = self
            .with_retry(&self.completion_circuit, || async move {
                match tokio::time::timeout(timeout, completion.complete(request, timeout)).await {
                    Ok(result) => result,
                    Err(_) => Err(CompletionError::Timeout),
                }
            })
            .await;
        let (reply, completion_failure) = match completed {
            Ok(text) => (text, None),
            Err(step) => {
                let failure = match step {
                    StepError::CircuitOpen => Failure::CompletionCircuitOpen,
                    StepError::Failed(e) => Failure::Completion(e),
                };
                log::warn!(
                    "relay {}: {}; sending fallback reply",
                    message.message_id,
                    failure
                );
                (self.settings.fallback_reply.clone(), Some(failure))
            }
        };

        trace_stage(Some(&message.message_id), Stage::Delivering);
        let outbound = OutboundMessage {
            conversation_id: message.conversation_id.clone(),
            text: reply,
        };
        let delivery = self.delivery.as_ref();
        let outbound_ref = &outbound;
        let timeout = self.settings.delivery_timeout;
        let delivered = self
            .with_retry(&self.delivery_circuit, || async move {
                let send = delivery.deliver(outbound_ref, timeout);
                let attempt = match tokio::time::timeout(timeout, send).await {
                    Ok(result) => result,
                    Err(_) => Err(DeliveryError::Timeout),
                };
                match attempt {
                    Ok(result) if result.success => Ok(()),
                    Ok(result) => Err(DeliveryError::from(result)),
                    Err(e) => Err(e),
                }
            })
            .await;

        let outcome = match (delivered, completion_failure) {
            (Ok(()), None) => RelayOutcome::Success {
                message_id: message.message_id.clone(),
                reply: outbound.text,
            },
            (Ok(()), Some(failure)) => RelayOutcome::Failed {
                message_id: message.message_id.clone(),
                failure,
                delivered_reply: Some(outbound.text),
            },
            (Err(step), _) => RelayOutcome::Failed {
                message_id: message.message_id.clone(),
                failure: match step {
                    StepError::CircuitOpen => Failure::DeliveryCircuitOpen,
                    StepError::Failed(e) => Failure::Delivery(e),
                },
                delivered_reply: None,
            },
        };
        trace_stage(Some(&message.message_id), Stage::Done);
        self.record(message, &outcome);
        outcome
    }

    fn record(&self, message: &CanonicalMessage, outcome: &RelayOutcome) {
        match outcome {
            RelayOutcome::Success { .. } => {
                self.dedup.record_outcome(&message.message_id, Outcome::Delivered);
                self.stats.succeeded();
                log::info!(
                    "relay {}: delivered reply to {}",
                    message.message_id,
                    message.conversation_id
                );
            }
            RelayOutcome::Failed {
                failure,
                delivered_reply,
                ..
            } => {
                self.dedup.record_outcome(&message.message_id, Outcome::Failed);
                self.stats.failed();
                log::error!(
                    "relay {}: failed for {}: {} (fallback delivered: {})",
                    message.message_id,
                    message.conversation_id,
                    failure,
                    delivered_reply.is_some()
                );
            }
            RelayOutcome::Ignored { .. } => {}
        }
    }

    /// Call `attempt` until it succeeds, fails non-transiently, or retries run out.
    /// The circuit admits the call once, before the first attempt, and is told about every
    /// result. An admitted call keeps its retry budget even if its own failures open the
    /// circuit, and then reports the provider's last error.
    async fn with_retry<T, E, F, Fut>(
        &self,
        circuit: &CircuitBreaker,
        mut attempt: F,
    ) -> Result<T, StepError<E>>
    where
        E: Transient + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retry = 0;
        loop {
            if retry == 0 && !circuit.try_acquire() {
                log::warn!("relay: {} circuit open, short-circuiting", circuit.name());
                return Err(StepError::CircuitOpen);
            }
            match attempt().await {
                Ok(value) => {
                    circuit.on_success();
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    circuit.on_failure();
                    if retry >= self.retry.max_retries {
                        return Err(StepError::Failed(e));
                    }
                    log::debug!(
                        "relay: {} attempt {} failed ({}), retrying",
                        circuit.name(),
                        retry + 1,
                        e
                    );
                    self.retry.sleep(retry).await;
                    retry += 1;
                }
                Err(e) => {
                    circuit.on_success();
                    return Err(StepError::Failed(e));
                }
            }
        }
    }
}
