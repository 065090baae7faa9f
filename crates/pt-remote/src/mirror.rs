//! Degrading mirror of a local session onto a [`RemoteBackend`].

use pt_types::{RemoteError, SessionState, TrialRecord};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::{
    CreateSessionRequest, FinalizeRequest, RemoteBackend, RemoteSessionId, TrialSubmission,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    Reachable,
    /// A call failed; no further calls are made for this session.
    Degraded,
}

/// What the mirror knows about the remote side of the current session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMirrorState {
    pub remote_session_id: Option<RemoteSessionId>,
    pub last_acked_ordinal: Option<u64>,
    pub reachability: Reachability,
    pub last_error: Option<RemoteError>,
    /// Degraded-mode warnings surfaced this session; never more than one.
    pub warnings: u32,
}

impl Default for RemoteMirrorState {
    fn default() -> Self {
        Self {
            remote_session_id: None,
            last_acked_ordinal: None,
            reachability: Reachability::Reachable,
            last_error: None,
            warnings: 0,
        }
    }
}

/// Result of a mirror call. Never an error: the caller carries on regardless.
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorOutcome {
    Ack,
    Unavailable(RemoteError),
    /// Not attempted: degraded, or no remote session exists.
    Skipped,
}

impl MirrorOutcome {
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack)
    }
}

/// Wraps a backend with per-call timeouts and a one-way degrade switch.
///
/// The first failed call moves the mirror to [`Reachability::Degraded`] and
/// emits a single warning. Every later call for the same session returns
/// [`MirrorOutcome::Skipped`] without touching the backend.
pub struct RemoteMirror {
    backend: Arc<dyn RemoteBackend>,
    timeout: Duration,
    state: RemoteMirrorState,
}

impl RemoteMirror {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(backend: Arc<dyn RemoteBackend>) -> Self {
        Self {
            backend,
            timeout: Self::DEFAULT_TIMEOUT,
            state: RemoteMirrorState::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn state(&self) -> &RemoteMirrorState {
        &self.state
    }

    pub fn is_degraded(&self) -> bool {
        self.state.reachability == Reachability::Degraded
    }

    /// Register a fresh session. Resets all state from any previous session.
    pub async fn create_session(&mut self, session: &SessionState) -> MirrorOutcome {
        self.state = RemoteMirrorState::default();
        let request = CreateSessionRequest::from(session);
        let backend = Arc::clone(&self.backend);

        match self.bounded(backend.create_session(&request)).await {
            Ok(remote_id) => {
                debug!(
                    session = %session.id(),
                    remote_session = %remote_id,
                    backend = backend.name(),
                    "remote session created"
                );
                self.state.remote_session_id = Some(remote_id);
                MirrorOutcome::Ack
            }
            Err(error) => self.degrade("create_session", error),
        }
    }

    pub async fn report_trial(&mut self, trial: &TrialRecord) -> MirrorOutcome {
        let Some(remote_id) = self.active_session() else {
            return MirrorOutcome::Skipped;
        };
        let submission = TrialSubmission::from(trial);
        let backend = Arc::clone(&self.backend);

        match self
            .bounded(backend.report_trial(&remote_id, &submission))
            .await
        {
            Ok(()) => {
                self.state.last_acked_ordinal = Some(trial.ordinal);
                MirrorOutcome::Ack
            }
            Err(error) => self.degrade("report_trial", error),
        }
    }

    pub async fn finalize(&mut self, session: &SessionState) -> MirrorOutcome {
        let Some(remote_id) = self.active_session() else {
            return MirrorOutcome::Skipped;
        };
        let request = FinalizeRequest::from(session);
        let backend = Arc::clone(&self.backend);

        match self.bounded(backend.finalize(&remote_id, &request)).await {
            Ok(()) => MirrorOutcome::Ack,
            Err(error) => self.degrade("finalize", error),
        }
    }

    fn active_session(&self) -> Option<RemoteSessionId> {
        if self.is_degraded() {
            return None;
        }
        self.state.remote_session_id.clone()
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    fn degrade(&mut self, operation: &str, error: RemoteError) -> MirrorOutcome {
        if self.state.warnings == 0 {
            warn!(
                operation,
                backend = self.backend.name(),
                error = %error,
                "remote service unavailable, continuing locally"
            );
            self.state.warnings += 1;
        }
        self.state.reachability = Reachability::Degraded;
        self.state.last_error = Some(error.clone());
        MirrorOutcome::Unavailable(error)
    }
}
