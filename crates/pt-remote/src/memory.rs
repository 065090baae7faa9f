//! In-process backend that records every call.

use async_trait::async_trait;
use parking_lot::Mutex;
use pt_types::RemoteError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{
    CreateSessionRequest, FinalizeRequest, RemoteBackend, RemoteSessionId, TrialSubmission,
};

/// Backend call kinds, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteOperation {
    CreateSession,
    ReportTrial,
    Finalize,
}

/// Everything the backend received for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSession {
    pub remote_id: RemoteSessionId,
    pub request: CreateSessionRequest,
    pub trials: Vec<TrialSubmission>,
    pub finalized: Option<FinalizeRequest>,
}

#[derive(Debug, Clone)]
struct FailureRule {
    operation: Option<RemoteOperation>,
    from_call: usize,
    error: RemoteError,
}

#[derive(Debug, Default)]
struct Recorder {
    sessions: Vec<RecordedSession>,
    calls: usize,
    rules: Vec<FailureRule>,
    latency: Option<Duration>,
}

impl Recorder {
    /// Count the call and return the injected error, if any.
    fn admit(&mut self, operation: RemoteOperation) -> Result<(), RemoteError> {
        let call = self.calls;
        self.calls += 1;
        let hit = self.rules.iter().find(|rule| {
            call >= rule.from_call && rule.operation.map_or(true, |op| op == operation)
        });
        match hit {
            Some(rule) => Err(rule.error.clone()),
            None => Ok(()),
        }
    }

    fn session_mut(
        &mut self,
        id: &RemoteSessionId,
    ) -> Result<&mut RecordedSession, RemoteError> {
        self.sessions
            .iter_mut()
            .find(|s| &s.remote_id == id)
            .ok_or(RemoteError::UnexpectedStatus { status: 404 })
    }
}

/// Shared, cloneable recorder implementing [`RemoteBackend`].
///
/// Clones share state, so a test can hand one clone to the orchestrator and
/// inspect the other afterwards.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    inner: Arc<Mutex<Recorder>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call to `operation` with `error`.
    pub fn fail_operation(&self, operation: RemoteOperation, error: RemoteError) {
        self.inner.lock().rules.push(FailureRule {
            operation: Some(operation),
            from_call: 0,
            error,
        });
    }

    /// Fail every call whose 0-based position is `call` or later.
    pub fn fail_from_call(&self, call: usize, error: RemoteError) {
        self.inner.lock().rules.push(FailureRule {
            operation: None,
            from_call: call,
            error,
        });
    }

    /// Delay every call, to exercise caller timeouts.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = Some(latency);
    }

    /// Total calls received, including failed ones.
    pub fn call_count(&self) -> usize {
        self.inner.lock().calls
    }

    pub fn sessions(&self) -> Vec<RecordedSession> {
        self.inner.lock().sessions.clone()
    }

    async fn delay(&self) {
        let latency = self.inner.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RemoteBackend for InMemoryBackend {
    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<RemoteSessionId, RemoteError> {
        self.delay().await;
        let mut inner = self.inner.lock();
        inner.admit(RemoteOperation::CreateSession)?;
        let remote_id = format!("remote-{}", inner.sessions.len() + 1);
        inner.sessions.push(RecordedSession {
            remote_id: remote_id.clone(),
            request: request.clone(),
            trials: Vec::new(),
            finalized: None,
        });
        Ok(remote_id)
    }

    async fn report_trial(
        &self,
        session: &RemoteSessionId,
        trial: &TrialSubmission,
    ) -> Result<(), RemoteError> {
        self.delay().await;
        let mut inner = self.inner.lock();
        inner.admit(RemoteOperation::ReportTrial)?;
        inner.session_mut(session)?.trials.push(trial.clone());
        Ok(())
    }

    async fn finalize(
        &self,
        session: &RemoteSessionId,
        request: &FinalizeRequest,
    ) -> Result<(), RemoteError> {
        self.delay().await;
        let mut inner = self.inner.lock();
        inner.admit(RemoteOperation::Finalize)?;
        inner.session_mut(session)?.finalized = Some(request.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}
