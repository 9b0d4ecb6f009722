//! Capacity-gated admission queue.
//!
//! Requests are classified into resource classes, each with its own
//! concurrency ceiling. A request is admitted straight away when its class
//! has a free slot; otherwise it waits in a queue ordered by priority
//! (highest first) and then by submission order. Dispatch scans the queue from
//! the head and admits the first request whose class has room, so a saturated
//! class never holds back work of another class.
//!
//! Dispatch runs on submission, whenever a slot is released, and on a fixed
//! tick. All queue and capacity state lives behind one lock; admission checks
//! and slot reservation happen in the same critical section.
//!
//! Admitted work is not cancellable. The only timeout is session idle expiry,
//! which reclaims resources and never interrupts a running operation.

use crate::config::{CapacityConfig, Config};
use crate::error::{QueueError, Result};
use crate::operation::{Operation, OperationRegistry, SessionContext};
use crate::process::{ProcessLauncher, ProcessRegistry};
use crate::reaper;
use crate::session::SessionRegistry;
use crate::workspace::WorkspaceManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bucket of operations sharing one concurrency ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceClass {
    ExclusiveAutomation,
    BackgroundTask,
    Persistence,
    ExternalApi,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 4] = [
        ResourceClass::ExclusiveAutomation,
        ResourceClass::BackgroundTask,
        ResourceClass::Persistence,
        ResourceClass::ExternalApi,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceClass::ExclusiveAutomation => "exclusive-automation",
            ResourceClass::BackgroundTask => "background-task",
            ResourceClass::Persistence => "persistence",
            ResourceClass::ExternalApi => "external-api",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ResourceClass::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| format!("unknown resource class: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// What a caller asks the queue to do.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub user_id: String,
    pub operation: String,
    pub resource_class: ResourceClass,
    pub payload: Value,
    pub priority: i32,
}

impl SubmitRequest {
    pub fn new(user_id: impl Into<String>, operation: impl Into<String>, resource_class: ResourceClass) -> Self {
        Self {
            user_id: user_id.into(),
            operation: operation.into(),
            resource_class,
            payload: Value::Null,
            priority: 0,
        }
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Bookkeeping for one request as it moves through the queue.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub id: String,
    pub user_id: String,
    pub operation: String,
    pub resource_class: ResourceClass,
    pub priority: i32,
    pub queued_at: Instant,
    pub started_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    pub status: RequestStatus,
    seq: u64,
}

type Responder = oneshot::Sender<Result<Value>>;

struct QueuedRequest {
    meta: RequestMeta,
    payload: Value,
    operation: Arc<dyn Operation>,
    responder: Responder,
}

impl QueuedRequest {
    // Priority descending, then submission order ascending.
    fn runs_before(&self, other: &QueuedRequest) -> bool {
        (self.meta.priority, std::cmp::Reverse(self.meta.seq))
            > (other.meta.priority, std::cmp::Reverse(other.meta.seq))
    }
}

/// Awaits the outcome of an enqueued request.
pub struct Submission {
    id: String,
    receiver: oneshot::Receiver<Result<Value>>,
}

impl Submission {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for Submission {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|settled| settled.unwrap_or_else(|_| Err(QueueError::ShuttingDown)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassStatus {
    pub queued: usize,
    pub in_flight: usize,
    pub max_concurrent: usize,
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub classes: BTreeMap<ResourceClass, ClassStatus>,
    pub total_sessions: usize,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStatus {
    pub fn class(&self, resource_class: ResourceClass) -> ClassStatus {
        self.classes[&resource_class]
    }
}

struct QueueState {
    queue: Vec<QueuedRequest>,
    in_flight: BTreeMap<ResourceClass, HashMap<String, RequestMeta>>,
    limits: CapacityConfig,
    next_seq: u64,
    completed: u64,
    failed: u64,
    accepting: bool,
}

impl QueueState {
    fn new(limits: CapacityConfig) -> Self {
        Self {
            queue: Vec::new(),
            in_flight: ResourceClass::ALL
                .into_iter()
                .map(|class| (class, HashMap::new()))
                .collect(),
            limits,
            next_seq: 0,
            completed: 0,
            failed: 0,
            accepting: true,
        }
    }

    fn in_flight_count(&self, class: ResourceClass) -> usize {
        self.in_flight.get(&class).map_or(0, HashMap::len)
    }

    fn has_capacity(&self, class: ResourceClass) -> bool {
        self.in_flight_count(class) < self.limits.max_for(class)
    }

    fn insert_sorted(&mut self, request: QueuedRequest) {
        let pos = self.queue.partition_point(|queued| queued.runs_before(&request));
        self.queue.insert(pos, request);
    }

    /// Reserve a slot for the request. Callers check capacity first.
    fn admit(&mut self, mut request: QueuedRequest) -> QueuedRequest {
        request.meta.status = RequestStatus::Processing;
        request.meta.started_at = Some(Instant::now());
        self.in_flight
            .entry(request.meta.resource_class)
            .or_default()
            .insert(request.meta.id.clone(), request.meta.clone());
        request
    }

    /// Admit the first queued request whose class has room.
    fn admit_next(&mut self) -> Option<QueuedRequest> {
        let pos = self
            .queue
            .iter()
            .position(|queued| self.has_capacity(queued.meta.resource_class))?;
        let request = self.queue.remove(pos);
        Some(self.admit(request))
    }

    fn drain_admissible(&mut self) -> Vec<QueuedRequest> {
        std::iter::from_fn(|| self.admit_next()).collect()
    }

    fn release(&mut self, meta: &RequestMeta) {
        let removed = self
            .in_flight
            .get_mut(&meta.resource_class)
            .and_then(|slots| slots.remove(&meta.id));
        if removed.is_none() {
            error!(request_id = %meta.id, resource_class = %meta.resource_class, "Released a request that was not in flight");
        }
        match meta.status {
            RequestStatus::Completed => self.completed += 1,
            _ => self.failed += 1,
        }
    }
}

struct Inner {
    state: Mutex<QueueState>,
    sessions: Arc<SessionRegistry>,
    operations: OperationRegistry,
}

impl Inner {
    fn spawn_execution(self: &Arc<Self>, request: QueuedRequest) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.execute(request).await });
    }

    async fn dispatch(self: &Arc<Self>) {
        let admitted = self.state.lock().await.drain_admissible();
        for request in admitted {
            debug!(request_id = %request.meta.id, resource_class = %request.meta.resource_class, "Admitted from queue");
            self.spawn_execution(request);
        }
    }

    async fn execute(self: Arc<Self>, request: QueuedRequest) {
        let QueuedRequest {
            mut meta,
            payload,
            operation,
            responder,
        } = request;

        let outcome = self.run(&meta, payload, operation).await;

        meta.completed_at = Some(Instant::now());
        meta.status = if outcome.is_ok() {
            RequestStatus::Completed
        } else {
            RequestStatus::Failed
        };

        // Free the slot before settling the caller, and hand it straight to
        // the next admissible request.
        let admitted = {
            let mut state = self.state.lock().await;
            state.release(&meta);
            state.drain_admissible()
        };

        let elapsed_ms = meta
            .started_at
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or_default();
        match &outcome {
            Ok(_) => info!(
                request_id = %meta.id,
                user_id = %meta.user_id,
                operation = %meta.operation,
                resource_class = %meta.resource_class,
                elapsed_ms,
                "Operation completed"
            ),
            Err(e) => warn!(
                request_id = %meta.id,
                user_id = %meta.user_id,
                operation = %meta.operation,
                resource_class = %meta.resource_class,
                elapsed_ms,
                error = %e,
                "Operation failed"
            ),
        }
        if responder.send(outcome).is_err() {
            debug!(request_id = %meta.id, "Caller dropped before the result arrived");
        }

        for request in admitted {
            self.spawn_execution(request);
        }
    }

    async fn run(&self, meta: &RequestMeta, payload: Value, operation: Arc<dyn Operation>) -> Result<Value> {
        let session = match self.sessions.get_or_create(&meta.user_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!(request_id = %meta.id, user_id = %meta.user_id, error = %e, "Could not obtain session");
                return Err(QueueError::SessionExpired(meta.user_id.clone()));
            }
        };
        let session_id = session.session_id.clone();
        self.sessions
            .start_operation(&meta.user_id, &session_id, &meta.id)
            .await?;

        let context = SessionContext::new(meta.id.clone(), session, Arc::clone(&self.sessions));
        // A separate task so a panicking body still reaches the accounting below.
        let body = tokio::spawn(async move { operation.run(payload, context).await });
        let outcome = match body.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(QueueError::from_operation(e)),
            Err(join_err) => {
                error!(request_id = %meta.id, operation = %meta.operation, error = %join_err, "Operation body panicked");
                Err(QueueError::OperationPanicked(meta.operation.clone()))
            }
        };

        self.sessions
            .complete_operation(&meta.user_id, &session_id, &meta.id)
            .await;
        outcome
    }
}

/// The admission queue, its dispatcher tick and its idle reaper.
pub struct Scheduler {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Build the scheduler and start its background tasks. Must be called
    /// from within a tokio runtime.
    pub fn start(config: &Config, operations: OperationRegistry, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let processes = Arc::new(ProcessRegistry::new(launcher));
        let sessions = Arc::new(SessionRegistry::new(
            config.session_timeout(),
            WorkspaceManager::new(&config.work_root),
            processes,
        ));
        let inner = Arc::new(Inner {
            state: Mutex::new(QueueState::new(config.capacity.clone())),
            sessions: Arc::clone(&sessions),
            operations,
        });
        let cancel = CancellationToken::new();

        let dispatcher = tokio::spawn(run_dispatcher(
            Arc::clone(&inner),
            config.tick_interval(),
            cancel.clone(),
        ));
        let reaper = tokio::spawn(reaper::run(sessions, config.reap_interval(), cancel.clone()));

        info!(
            work_root = %config.work_root.display(),
            session_timeout_secs = config.session_timeout_secs,
            "Scheduler started"
        );
        Self {
            inner,
            cancel,
            tasks: Mutex::new(vec![dispatcher, reaper]),
        }
    }

    /// Queue a request and return a handle that resolves with its outcome.
    pub async fn enqueue(&self, request: SubmitRequest) -> Result<Submission> {
        let SubmitRequest {
            user_id,
            operation,
            resource_class,
            payload,
            priority,
        } = request;

        let body = self
            .inner
            .operations
            .get(resource_class, &operation)
            .ok_or_else(|| QueueError::UnknownOperation {
                resource_class,
                operation: operation.clone(),
            })?;

        let id = uuid::Uuid::new_v4().to_string();
        let (responder, receiver) = oneshot::channel();

        let admitted = {
            let mut state = self.inner.state.lock().await;
            if !state.accepting {
                return Err(QueueError::ShuttingDown);
            }
            let seq = state.next_seq;
            state.next_seq += 1;

            let request = QueuedRequest {
                meta: RequestMeta {
                    id: id.clone(),
                    user_id,
                    operation,
                    resource_class,
                    priority,
                    queued_at: Instant::now(),
                    started_at: None,
                    completed_at: None,
                    status: RequestStatus::Queued,
                    seq,
                },
                payload,
                operation: body,
                responder,
            };

            if state.has_capacity(resource_class) {
                Some(state.admit(request))
            } else {
                debug!(
                    request_id = %id,
                    resource_class = %resource_class,
                    priority,
                    queued = state.queue.len() + 1,
                    "Class saturated, queueing"
                );
                state.insert_sorted(request);
                None
            }
        };

        if let Some(request) = admitted {
            debug!(request_id = %id, resource_class = %resource_class, "Admitted immediately");
            self.inner.spawn_execution(request);
        }
        Ok(Submission { id, receiver })
    }

    /// Queue a request and wait for its outcome.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Value> {
        self.enqueue(request).await?.await
    }

    pub async fn status(&self) -> QueueStatus {
        let (classes, completed, failed) = {
            let state = self.inner.state.lock().await;
            let classes = ResourceClass::ALL
                .into_iter()
                .map(|class| {
                    let status = ClassStatus {
                        queued: state
                            .queue
                            .iter()
                            .filter(|queued| queued.meta.resource_class == class)
                            .count(),
                        in_flight: state.in_flight_count(class),
                        max_concurrent: state.limits.max_for(class),
                    };
                    (class, status)
                })
                .collect();
            (classes, state.completed, state.failed)
        };
        QueueStatus {
            classes,
            total_sessions: self.inner.sessions.count().await,
            completed,
            failed,
        }
    }

    /// Destroy the user's session ahead of its idle timeout.
    pub async fn cleanup_session(&self, user_id: &str) {
        self.inner.sessions.destroy(user_id).await;
    }

    /// Run one dispatch pass without waiting for the next tick.
    pub async fn dispatch(&self) {
        self.inner.dispatch().await;
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.inner.sessions
    }

    /// Stop background tasks, fail queued requests and tear down every session.
    /// Requests already running are left to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let rejected: Vec<QueuedRequest> = {
            let mut state = self.inner.state.lock().await;
            state.accepting = false;
            let drained: Vec<QueuedRequest> = state.queue.drain(..).collect();
            state.failed += drained.len() as u64;
            drained
        };
        for request in rejected {
            let _ = request.responder.send(Err(QueueError::ShuttingDown));
        }

        let destroyed = self.inner.sessions.destroy_all().await;
        info!(destroyed, "Scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_dispatcher(inner: Arc<Inner>, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => inner.dispatch().await,
        }
    }
    debug!("Dispatcher stopped");
}
