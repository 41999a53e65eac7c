// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session registry: capacity-capped `user_id → Session` map with shared
//! in-flight starts, lease counting, an idle reaper, and orderly shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GateConfig;
use crate::error::GateError;

use super::{Launcher, Session, SessionState};

/// Grace period for a child to exit after stdin closes.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// How long shutdown waits for in-flight leases to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

type StartResult = Result<Arc<Session>, String>;

enum Slot {
    /// A start is in flight; concurrent acquirers wait on the channel.
    Starting(watch::Receiver<Option<StartResult>>),
    Live(Arc<Session>),
}

/// Owns all sessions. HTTP requests borrow sessions through counted leases.
pub struct SessionManager {
    config: GateConfig,
    launcher: Arc<dyn Launcher>,
    sessions: tokio::sync::Mutex<HashMap<String, Slot>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(config: GateConfig, launcher: Arc<dyn Launcher>) -> Arc<Self> {
        Arc::new(Self {
            config,
            launcher,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Get or create the session for `user_id` and lease it.
    ///
    /// Capacity is enforced on insertion: when the registry is full a new
    /// user is refused rather than evicting an active session.
    pub async fn acquire(self: &Arc<Self>, user_id: &str) -> Result<SessionLease, GateError> {
        enum Next {
            Use(Arc<Session>),
            Wait(watch::Receiver<Option<StartResult>>),
            Start(watch::Sender<Option<StartResult>>),
        }

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(GateError::capacity("Server is shutting down"));
            }

            let next = {
                let mut sessions = self.sessions.lock().await;
                let decision = match sessions.get(user_id) {
                    Some(Slot::Live(session)) => {
                        let session = Arc::clone(session);
                        if session.is_dead() {
                            None
                        } else {
                            Some(Next::Use(session))
                        }
                    }
                    Some(Slot::Starting(rx)) => Some(Next::Wait(rx.clone())),
                    None => {
                        if sessions.len() >= self.config.max_sessions {
                            warn!(user_id, "registry at capacity, refusing new session");
                            return Err(GateError::capacity(
                                "Session capacity reached, retry later",
                            ));
                        }
                        let (tx, rx) = watch::channel(None);
                        sessions.insert(user_id.to_owned(), Slot::Starting(rx));
                        Some(Next::Start(tx))
                    }
                };
                match decision {
                    Some(next) => next,
                    None => {
                        debug!(user_id, "discarding dead session");
                        sessions.remove(user_id);
                        continue;
                    }
                }
            };

            match next {
                Next::Use(session) => return self.lease_checked(session).await,
                Next::Start(tx) => return self.start_session(user_id, tx).await,
                Next::Wait(mut rx) => {
                    // Share the in-flight start with its initiator.
                    loop {
                        if rx.borrow().is_some() {
                            break;
                        }
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                    let outcome = rx.borrow().clone();
                    match outcome {
                        Some(Ok(session)) => return self.lease_checked(session).await,
                        Some(Err(detail)) => return Err(GateError::upstream(detail)),
                        None => return Err(GateError::internal("session start abandoned")),
                    }
                }
            }
        }
    }

    /// Run the start outside the registry lock, then publish the outcome to
    /// every waiter.
    async fn start_session(
        self: &Arc<Self>,
        user_id: &str,
        tx: watch::Sender<Option<StartResult>>,
    ) -> Result<SessionLease, GateError> {
        let data_dir = self.config.user_data_dir(user_id);
        let started = Session::start(
            user_id,
            data_dir,
            self.launcher.as_ref(),
            self.config.api_key.as_deref(),
            self.config.model.clone(),
        )
        .await;

        let mut sessions = self.sessions.lock().await;
        match started {
            Ok(session) => {
                if self.closed.load(Ordering::Acquire) {
                    sessions.remove(user_id);
                    drop(sessions);
                    let _ = tx.send(Some(Err("server is shutting down".to_owned())));
                    session.teardown(TEARDOWN_GRACE).await;
                    return Err(GateError::capacity("Server is shutting down"));
                }
                sessions.insert(user_id.to_owned(), Slot::Live(Arc::clone(&session)));
                drop(sessions);
                let _ = tx.send(Some(Ok(Arc::clone(&session))));
                Ok(self.lease(session))
            }
            Err(err) => {
                sessions.remove(user_id);
                drop(sessions);
                warn!(user_id, "session start failed: {err}");
                let _ = tx.send(Some(Err(err.detail.clone())));
                Err(err)
            }
        }
    }

    /// Lease a live session, running the post-timeout health probe first
    /// when one is pending. A failed probe tears the session down and
    /// retries with a fresh child.
    async fn lease_checked(self: &Arc<Self>, session: Arc<Session>) -> Result<SessionLease, GateError> {
        if session.probe_pending() {
            if let Err(err) = session.probe().await {
                warn!(user_id = %session.user_id(), "probe failed, replacing session: {err}");
                self.discard(&session).await;
                return Box::pin(self.acquire(session.user_id())).await;
            }
        }
        Ok(self.lease(session))
    }

    fn lease(self: &Arc<Self>, session: Arc<Session>) -> SessionLease {
        session.incr_leases();
        session.touch();
        SessionLease { session, manager: Arc::clone(self) }
    }

    /// Remove a session from the registry (if still present) and close its
    /// transport. Used when a transport failure surfaces: the next acquire
    /// spawns a fresh child.
    pub async fn discard(&self, session: &Arc<Session>) {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(session.user_id()) {
                Some(Slot::Live(live)) if Arc::ptr_eq(live, session) => {
                    sessions.remove(session.user_id())
                }
                _ => None,
            }
        };
        if removed.is_some() {
            info!(user_id = %session.user_id(), "session discarded");
        }
        session.teardown(TEARDOWN_GRACE).await;
    }

    /// Number of registered sessions (live plus starting).
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Reap idle sessions: lease count zero and idle beyond the threshold.
    /// Never touches a leased session, never reaps for capacity.
    async fn reap_idle(&self) {
        let idle_timeout = self.config.idle_timeout();
        let victims: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            let expired: Vec<String> = sessions
                .iter()
                .filter_map(|(user, slot)| match slot {
                    Slot::Live(s)
                        if s.lease_count() == 0
                            && (s.idle_for() > idle_timeout || s.is_dead()) =>
                    {
                        Some(user.clone())
                    }
                    _ => None,
                })
                .collect();
            expired
                .iter()
                .filter_map(|user| match sessions.remove(user) {
                    Some(Slot::Live(s)) => Some(s),
                    _ => None,
                })
                .collect()
        };

        for session in victims {
            info!(user_id = %session.user_id(), idle = ?session.idle_for(), "reaping idle session");
            session.set_state(SessionState::Draining);
            session.teardown(TEARDOWN_GRACE).await;
        }
    }

    /// Refuse new acquires, wait for leases to drain within the grace
    /// period, then force-close every transport.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.cancel();

        let sessions: Vec<Arc<Session>> = {
            let mut map = self.sessions.lock().await;
            map.drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Live(s) => Some(s),
                    Slot::Starting(_) => None,
                })
                .collect()
        };

        for session in &sessions {
            session.set_state(SessionState::Draining);
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while sessions.iter().any(|s| s.lease_count() > 0) {
            if tokio::time::Instant::now() >= deadline {
                warn!("shutdown grace expired with leases outstanding");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for session in sessions {
            session.teardown(TEARDOWN_GRACE).await;
        }
        info!("session manager shut down");
    }
}

/// Spawn the background reaper for idle sessions.
pub fn spawn_reaper(manager: Arc<SessionManager>) {
    let interval = manager.config.cleanup_interval();
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = manager.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            manager.reap_idle().await;
        }
    });
}

/// A counted borrow of a session; dropping it releases the lease.
pub struct SessionLease {
    session: Arc<Session>,
    manager: Arc<SessionManager>,
}

impl SessionLease {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Tear the session down when its transport failed mid-request, so the
    /// next acquire starts a fresh child.
    pub async fn discard_dead(&self) {
        if self.session.is_dead() {
            self.manager.discard(&self.session).await;
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.session.decr_leases();
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
