//! Per-user sessions: one live session per user, each owning a working
//! directory and at most one automation process per application.
//!
//! A session expires once it has been idle for longer than the configured
//! timeout *and* has no operations in flight. Operations in flight pin a
//! session, so neither the reaper nor `get_or_create` tears it down underneath
//! running work.

use crate::error::{QueueError, Result};
use crate::process::{Application, ProcessHandle, ProcessRegistry};
use crate::workspace::{SessionDirs, WorkspaceManager};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A user's session.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub session_id: String,
    pub start_time: Instant,
    pub last_activity: Instant,
    pub active_operations: HashSet<String>,
    pub processes: BTreeMap<Application, u32>,
    pub dirs: SessionDirs,
}

impl Session {
    fn new(user_id: &str, session_id: String, dirs: SessionDirs) -> Self {
        let now = Instant::now();
        Self {
            user_id: user_id.to_string(),
            session_id,
            start_time: now,
            last_activity: now,
            active_operations: HashSet::new(),
            processes: BTreeMap::new(),
            dirs,
        }
    }

    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.active_operations.is_empty() && now.duration_since(self.last_activity) > timeout
    }

    fn info(&self, now: Instant) -> SessionInfo {
        SessionInfo {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            working_dir: self.dirs.root().display().to_string(),
            age_secs: now.duration_since(self.start_time).as_secs(),
            idle_secs: now.duration_since(self.last_activity).as_secs(),
            active_operations: self.active_operations.len(),
            processes: self.processes.clone(),
        }
    }
}

/// Serializable view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub user_id: String,
    pub session_id: String,
    pub working_dir: String,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub active_operations: usize,
    pub processes: BTreeMap<Application, u32>,
}

/// Outcome of one idle sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapReport {
    pub reaped: usize,
    /// Idle past the timeout but still running operations.
    pub deferred: usize,
}

/// Maps user ids to their live session.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    creation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    timeout: Duration,
    workspaces: WorkspaceManager,
    processes: Arc<ProcessRegistry>,
}

impl SessionRegistry {
    pub fn new(timeout: Duration, workspaces: WorkspaceManager, processes: Arc<ProcessRegistry>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
            timeout,
            workspaces,
            processes,
        }
    }

    pub fn processes(&self) -> &Arc<ProcessRegistry> {
        &self.processes
    }

    /// Return the user's live session, creating one if there is none.
    ///
    /// Creation is serialized per user, so concurrent first requests from the
    /// same user share one session.
    pub async fn get_or_create(&self, user_id: &str) -> Result<Session> {
        if let Some(session) = self.touch_live(user_id).await {
            return Ok(session);
        }

        let lock = self.creation_lock(user_id).await;
        let _guard = lock.lock().await;

        if let Some(session) = self.touch_live(user_id).await {
            return Ok(session);
        }

        let stale = self.sessions.write().await.remove(user_id);
        if let Some(stale) = stale {
            debug!(user_id, session_id = %stale.session_id, "Replacing expired session");
            self.teardown(&stale).await;
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let dirs = self.workspaces.create(user_id, &session_id).await?;
        let session = Session::new(user_id, session_id, dirs);

        let (live, displaced) = {
            let mut sessions = self.sessions.write().await;
            let now = Instant::now();
            match sessions.entry(user_id.to_string()) {
                Entry::Occupied(mut entry) if !entry.get().is_expired(now, self.timeout) => {
                    entry.get_mut().last_activity = now;
                    (Some(entry.get().clone()), None)
                }
                Entry::Occupied(mut entry) => (None, Some(entry.insert(session.clone()))),
                Entry::Vacant(entry) => {
                    entry.insert(session.clone());
                    (None, None)
                }
            }
        };

        if let Some(live) = live {
            debug!(user_id, session_id = %live.session_id, "Lost creation race, discarding new session");
            self.teardown(&session).await;
            return Ok(live);
        }
        if let Some(stale) = displaced {
            debug!(user_id, session_id = %stale.session_id, "Replacing expired session");
            self.teardown(&stale).await;
        }

        info!(user_id, session_id = %session.session_id, "Created session");
        Ok(session)
    }

    /// Read-only lookup. Expired sessions read as absent.
    pub async fn get(&self, user_id: &str) -> Option<Session> {
        let sessions = self.sessions.read().await;
        sessions
            .get(user_id)
            .filter(|s| !s.is_expired(Instant::now(), self.timeout))
            .cloned()
    }

    /// Bump the session's idle clock. A replaced or destroyed session is left
    /// alone, so stale work never keeps the user's newer session alive.
    pub async fn touch(&self, user_id: &str, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(user_id) {
            Some(session) if session.session_id == session_id => {
                session.last_activity = Instant::now();
                true
            }
            _ => {
                warn!(user_id, session_id, "touch on missing session");
                false
            }
        }
    }

    /// Register an in-flight operation on the session.
    pub async fn start_operation(&self, user_id: &str, session_id: &str, op_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(user_id) {
            Some(session) if session.session_id == session_id => {
                session.active_operations.insert(op_id.to_string());
                session.last_activity = Instant::now();
                Ok(())
            }
            _ => {
                warn!(user_id, session_id, op_id, "start_operation on missing session");
                Err(QueueError::SessionExpired(user_id.to_string()))
            }
        }
    }

    pub async fn complete_operation(&self, user_id: &str, session_id: &str, op_id: &str) {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(user_id) {
            Some(session) if session.session_id == session_id => {
                session.active_operations.remove(op_id);
                session.last_activity = Instant::now();
            }
            _ => warn!(user_id, session_id, op_id, "complete_operation on missing session"),
        }
    }

    /// Acquire an exclusive process for the session and record it.
    pub async fn bind_process(
        &self,
        user_id: &str,
        session_id: &str,
        application: Application,
    ) -> Result<ProcessHandle> {
        let working_dir = {
            let sessions = self.sessions.read().await;
            match sessions.get(user_id) {
                Some(s) if s.session_id == session_id => s.dirs.for_application(application),
                _ => return Err(QueueError::SessionExpired(user_id.to_string())),
            }
        };

        let handle = self
            .processes
            .acquire(user_id, session_id, application, &working_dir)
            .await?;

        let bound = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(user_id) {
                Some(s) if s.session_id == session_id => {
                    s.processes.insert(application, handle.pid);
                    s.last_activity = Instant::now();
                    true
                }
                _ => false,
            }
        };
        if !bound {
            warn!(user_id, session_id, pid = handle.pid, "Session vanished while binding process");
            self.processes.release(handle.pid).await;
            return Err(QueueError::SessionExpired(user_id.to_string()));
        }
        Ok(handle)
    }

    /// Release the session's process for `application`, if it has one.
    pub async fn unbind_process(&self, user_id: &str, session_id: &str, application: Application) -> bool {
        let pid = {
            let mut sessions = self.sessions.write().await;
            sessions
                .get_mut(user_id)
                .filter(|s| s.session_id == session_id)
                .and_then(|s| s.processes.remove(&application))
        };
        match pid {
            Some(pid) => self.processes.release(pid).await,
            None => false,
        }
    }

    /// Tear down the user's session. Destroying a missing session is a no-op.
    pub async fn destroy(&self, user_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(user_id);
        self.forget_creation_lock(user_id).await;

        let Some(session) = removed else {
            debug!(user_id, "destroy on missing session");
            return false;
        };
        if !session.active_operations.is_empty() {
            warn!(
                user_id,
                session_id = %session.session_id,
                active = session.active_operations.len(),
                "Destroying session with operations in flight"
            );
        }
        self.teardown(&session).await;
        info!(user_id, session_id = %session.session_id, "Destroyed session");
        true
    }

    /// Destroy every expired session. Idle sessions with operations in flight
    /// are left for a later sweep.
    pub async fn reap_idle(&self) -> ReapReport {
        let now = Instant::now();
        let (candidates, deferred) = {
            let sessions = self.sessions.read().await;
            let idle = |s: &&Session| now.duration_since(s.last_activity) > self.timeout;
            let candidates: Vec<String> = sessions
                .values()
                .filter(idle)
                .filter(|s| s.active_operations.is_empty())
                .map(|s| s.user_id.clone())
                .collect();
            let deferred = sessions
                .values()
                .filter(idle)
                .filter(|s| !s.active_operations.is_empty())
                .count();
            (candidates, deferred)
        };

        let mut report = ReapReport {
            reaped: 0,
            deferred,
        };
        for user_id in candidates {
            // Re-check under the write lock; the user may have come back.
            let expired = {
                let mut sessions = self.sessions.write().await;
                match sessions.get(&user_id) {
                    Some(s) if s.is_expired(Instant::now(), self.timeout) => sessions.remove(&user_id),
                    _ => None,
                }
            };
            if let Some(session) = expired {
                info!(user_id = %user_id, session_id = %session.session_id, "Reaping idle session");
                self.forget_creation_lock(&user_id).await;
                self.teardown(&session).await;
                report.reaped += 1;
            }
        }
        if report.deferred > 0 {
            debug!(deferred = report.deferred, "Deferred reaping sessions with operations in flight");
        }
        report
    }

    pub async fn destroy_all(&self) -> usize {
        let drained: Vec<Session> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        self.creation_locks
            .lock()
            .await
            .retain(|_, lock| Arc::strong_count(lock) > 1);
        for session in &drained {
            self.teardown(session).await;
        }
        drained.len()
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionInfo> = sessions.values().map(|s| s.info(now)).collect();
        list.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        list
    }

    pub async fn info(&self, user_id: &str) -> Option<SessionInfo> {
        self.get(user_id).await.map(|s| s.info(Instant::now()))
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn touch_live(&self, user_id: &str) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        let now = Instant::now();
        let session = sessions
            .get_mut(user_id)
            .filter(|s| !s.is_expired(now, self.timeout))?;
        session.last_activity = now;
        Some(session.clone())
    }

    async fn creation_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.creation_locks
            .lock()
            .await
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    // A lock still held or awaited by a creator must stay in the map, or a
    // second creator would get a fresh one and race it.
    async fn forget_creation_lock(&self, user_id: &str) {
        let mut locks = self.creation_locks.lock().await;
        if locks.get(user_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(user_id);
        }
    }

    async fn teardown(&self, session: &Session) {
        let released = self.processes.release_session(&session.session_id).await;
        if released > 0 {
            debug!(session_id = %session.session_id, released, "Released session processes");
        }
        if let Err(e) = self.workspaces.destroy(&session.dirs).await {
            warn!(
                session_id = %session.session_id,
                path = %session.dirs.root().display(),
                error = %e,
                "Failed to remove session directory"
            );
        }
    }
}
