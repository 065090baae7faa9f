//! Remote coordination service abstraction and its wire messages.

use async_trait::async_trait;
use pt_types::{
    lenient_max_trials, ConfigurationSpace, MaxTrials, Metrics, ObjectiveSet, ParameterValue,
    RemoteError, SessionId, SessionState, SessionStatus, TerminationReason, TrialRecord,
    TrialStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier the remote service assigns to a mirrored session.
pub type RemoteSessionId = String;

/// Body of the session registration call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub local_session_id: SessionId,
    pub strategy: String,
    pub objectives: ObjectiveSet,
    #[serde(with = "lenient_max_trials")]
    pub max_trials: MaxTrials,
    pub space: ConfigurationSpace,
}

impl From<&SessionState> for CreateSessionRequest {
    fn from(session: &SessionState) -> Self {
        Self {
            local_session_id: session.id(),
            strategy: session.strategy().to_string(),
            objectives: session.objectives().clone(),
            max_trials: session.max_trials(),
            space: session.space().clone(),
        }
    }
}

/// One finished trial as reported to the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSubmission {
    pub ordinal: u64,
    pub configuration: BTreeMap<String, ParameterValue>,
    pub status: TrialStatus,
    pub metrics: Option<Metrics>,
    pub duration_ms: u64,
    pub examples_total: usize,
    pub examples_failed: usize,
}

impl From<&TrialRecord> for TrialSubmission {
    fn from(trial: &TrialRecord) -> Self {
        Self {
            ordinal: trial.ordinal,
            configuration: trial.configuration.values().clone(),
            status: trial.status,
            metrics: trial.metrics.clone(),
            duration_ms: trial.duration.as_millis() as u64,
            examples_total: trial.examples_total,
            examples_failed: trial.failures.len(),
        }
    }
}

/// Terminal snapshot sent when the session ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeRequest {
    pub status: SessionStatus,
    pub termination: Option<TerminationReason>,
    pub completed: u64,
    pub trials_issued: usize,
    /// Best value per objective.
    pub best: BTreeMap<String, f64>,
}

impl From<&SessionState> for FinalizeRequest {
    fn from(session: &SessionState) -> Self {
        let best = session
            .objectives()
            .iter()
            .filter_map(|o| session.best_value(&o.name).map(|v| (o.name.clone(), v)))
            .collect();

        Self {
            status: session.status(),
            termination: session.termination().cloned(),
            completed: session.completed_count(),
            trials_issued: session.trials().len(),
            best,
        }
    }
}

/// Remote coordination service.
///
/// Implementations report failures as [`RemoteError`] and must not retry;
/// degradation policy lives in [`crate::RemoteMirror`].
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Register a session and return the remote identifier.
    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<RemoteSessionId, RemoteError>;

    /// Mirror one finished trial.
    async fn report_trial(
        &self,
        session: &RemoteSessionId,
        trial: &TrialSubmission,
    ) -> Result<(), RemoteError>;

    /// Mark the remote session as finished.
    async fn finalize(
        &self,
        session: &RemoteSessionId,
        request: &FinalizeRequest,
    ) -> Result<(), RemoteError>;

    /// Backend name for logs.
    fn name(&self) -> &str;
}
