//! The authoritative record of one optimization run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{ConfigurationError, SessionError};
use crate::objective::ObjectiveSet;
use crate::space::{Configuration, ConfigurationSpace};
use crate::trial::{TrialRecord, TrialStatus};

/// Unique session identifier.
pub type SessionId = Uuid;

/// Trial budget. There is no "absent" value: a missing limit is `Unbounded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxTrials {
    Limited(NonZeroU64),
    Unbounded,
}

impl MaxTrials {
    /// Normalize an optional limit. `None` means unbounded, `Some(0)` is rejected.
    pub fn new(limit: Option<u64>) -> Result<Self, ConfigurationError> {
        match limit {
            None => Ok(Self::Unbounded),
            Some(n) => NonZeroU64::new(n)
                .map(Self::Limited)
                .ok_or(ConfigurationError::InvalidMaxTrials(n)),
        }
    }

    pub fn limited(n: u64) -> Result<Self, ConfigurationError> {
        Self::new(Some(n))
    }

    pub fn limit(&self) -> Option<u64> {
        match self {
            Self::Limited(n) => Some(n.get()),
            Self::Unbounded => None,
        }
    }

    /// Always false for `Unbounded`.
    pub fn is_reached(&self, completed: u64) -> bool {
        match self {
            Self::Limited(n) => completed >= n.get(),
            Self::Unbounded => false,
        }
    }
}

impl Default for MaxTrials {
    fn default() -> Self {
        Self::Unbounded
    }
}

impl From<NonZeroU64> for MaxTrials {
    fn from(n: NonZeroU64) -> Self {
        Self::Limited(n)
    }
}

impl fmt::Display for MaxTrials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(n) => write!(f, "{n}"),
            Self::Unbounded => f.write_str("unbounded"),
        }
    }
}

/// Field adapter for settings files: accepts a bare integer, `null`, a missing
/// field (with `#[serde(default)]`) or the tagged form. Serializes tagged.
pub mod lenient_max_trials {
    use super::MaxTrials;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Count(u64),
        Tagged(MaxTrials),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<MaxTrials, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Repr>::deserialize(deserializer)? {
            None => Ok(MaxTrials::Unbounded),
            Some(Repr::Count(n)) => MaxTrials::new(Some(n)).map_err(D::Error::custom),
            Some(Repr::Tagged(m)) => Ok(m),
        }
    }

    pub fn serialize<S>(value: &MaxTrials, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.serialize(serializer)
    }
}

/// Lifecycle state for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    Completed,
    StoppedEarly,
    Exhausted,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Created | Self::Running)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminationReason {
    MaxTrialsReached,
    Exhausted,
    EarlyStopped { message: String },
    Cancelled,
    InfrastructureFailure { message: String },
}

impl TerminationReason {
    pub fn status(&self) -> SessionStatus {
        match self {
            Self::MaxTrialsReached => SessionStatus::Completed,
            Self::Exhausted => SessionStatus::Exhausted,
            Self::EarlyStopped { .. } | Self::Cancelled => SessionStatus::StoppedEarly,
            Self::InfrastructureFailure { .. } => SessionStatus::Failed,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::MaxTrialsReached => "max_trials_reached",
            Self::Exhausted => "exhausted",
            Self::EarlyStopped { .. } => "early_stopped",
            Self::Cancelled => "cancelled",
            Self::InfrastructureFailure { .. } => "infrastructure_failure",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EarlyStopped { message } | Self::InfrastructureFailure { message } => {
                write!(f, "{}: {message}", self.code())
            }
            _ => f.write_str(self.code()),
        }
    }
}

/// Best observation for one objective.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestTrial {
    pub ordinal: u64,
    pub value: f64,
}

/// State of one optimization run.
///
/// Trials are appended in strict ordinal order and the best-so-far per
/// objective is updated synchronously on every append, so a reader holding a
/// `&SessionState` always sees a consistent, monotonic view. Once a
/// termination reason is set every mutator returns [`SessionError::Terminal`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    id: SessionId,
    space: Arc<ConfigurationSpace>,
    strategy: String,
    objectives: ObjectiveSet,
    max_trials: MaxTrials,
    trials: Vec<TrialRecord>,
    completed_count: u64,
    best: BTreeMap<String, BestTrial>,
    status: SessionStatus,
    termination: Option<TerminationReason>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    executed: HashSet<u64>,
}

impl SessionState {
    pub fn new(
        space: Arc<ConfigurationSpace>,
        strategy: impl Into<String>,
        objectives: ObjectiveSet,
        max_trials: MaxTrials,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            space,
            strategy: strategy.into(),
            objectives,
            max_trials,
            trials: Vec::new(),
            completed_count: 0,
            best: BTreeMap::new(),
            status: SessionStatus::Created,
            termination: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            executed: HashSet::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn space(&self) -> &ConfigurationSpace {
        &self.space
    }

    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    pub fn objectives(&self) -> &ObjectiveSet {
        &self.objectives
    }

    pub fn max_trials(&self) -> MaxTrials {
        self.max_trials
    }

    pub fn trials(&self) -> &[TrialRecord] {
        &self.trials
    }

    /// Succeeded plus failed trials; skipped ones are excluded.
    pub fn completed_count(&self) -> u64 {
        self.completed_count
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn termination(&self) -> Option<&TerminationReason> {
        self.termination.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn next_ordinal(&self) -> u64 {
        self.trials.len() as u64 + 1
    }

    pub fn max_trials_reached(&self) -> bool {
        self.max_trials.is_reached(self.completed_count)
    }

    /// Whether a configuration with this enumeration index already ran.
    pub fn has_executed(&self, configuration: &Configuration) -> bool {
        self.executed.contains(&configuration.index())
    }

    pub fn count_with_status(&self, status: TrialStatus) -> usize {
        self.trials.iter().filter(|t| t.status == status).count()
    }

    pub fn best(&self, objective: &str) -> Option<BestTrial> {
        self.best.get(objective).copied()
    }

    pub fn best_value(&self, objective: &str) -> Option<f64> {
        self.best(objective).map(|b| b.value)
    }

    pub fn best_trial(&self, objective: &str) -> Option<&TrialRecord> {
        let best = self.best.get(objective)?;
        self.trials.get((best.ordinal - 1) as usize)
    }

    /// Best trial under the primary objective.
    pub fn best_configuration(&self) -> Option<&Configuration> {
        self.best_trial(&self.objectives.primary().name)
            .map(|t| &t.configuration)
    }

    /// `created → running`.
    pub fn start(&mut self) -> Result<(), SessionError> {
        match self.status {
            SessionStatus::Created => {
                self.status = SessionStatus::Running;
                self.started_at = Some(Utc::now());
                Ok(())
            }
            SessionStatus::Running => Ok(()),
            _ => Err(SessionError::Terminal),
        }
    }

    /// Append a trial and fold its metrics into the best-so-far table.
    pub fn record(&mut self, trial: TrialRecord) -> Result<(), SessionError> {
        match self.status {
            SessionStatus::Running => {}
            SessionStatus::Created => return Err(SessionError::NotRunning),
            _ => return Err(SessionError::Terminal),
        }

        let expected = self.next_ordinal();
        if trial.ordinal != expected {
            return Err(SessionError::OrdinalOutOfOrder {
                expected,
                got: trial.ordinal,
            });
        }

        if trial.is_completed() {
            self.completed_count += 1;
            self.executed.insert(trial.configuration.index());
        }

        if trial.status == TrialStatus::Succeeded {
            if let Some(metrics) = &trial.metrics {
                for objective in &self.objectives {
                    let Some(&value) = metrics.get(&objective.name) else {
                        continue;
                    };
                    if !value.is_finite() {
                        continue;
                    }
                    let improved = match self.best.get(&objective.name) {
                        None => true,
                        Some(current) => objective.is_better(value, current.value),
                    };
                    if improved {
                        self.best.insert(
                            objective.name.clone(),
                            BestTrial {
                                ordinal: trial.ordinal,
                                value,
                            },
                        );
                    }
                }
            }
        }

        self.trials.push(trial);
        Ok(())
    }

    /// Enter a terminal state. Allowed from `created` (failure before the
    /// first trial) and `running`.
    pub fn terminate(&mut self, reason: TerminationReason) -> Result<(), SessionError> {
        if self.is_terminal() {
            return Err(SessionError::Terminal);
        }
        self.status = reason.status();
        self.termination = Some(reason);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn summary(&self) -> SessionSummary {
        let best = self
            .best
            .iter()
            .filter_map(|(name, b)| {
                let trial = self.trials.get((b.ordinal - 1) as usize)?;
                Some((
                    name.clone(),
                    BestSummary {
                        ordinal: b.ordinal,
                        value: b.value,
                        configuration: trial.configuration.clone(),
                    },
                ))
            })
            .collect();

        SessionSummary {
            session_id: self.id,
            strategy: self.strategy.clone(),
            status: self.status,
            termination: self.termination.clone(),
            max_trials: self.max_trials,
            space_size: self.space.size(),
            trials_issued: self.trials.len(),
            completed: self.completed_count,
            succeeded: self.count_with_status(TrialStatus::Succeeded),
            failed: self.count_with_status(TrialStatus::Failed),
            skipped: self.count_with_status(TrialStatus::Skipped),
            primary_objective: self.objectives.primary().name.clone(),
            best_configuration: self.best_configuration().cloned(),
            best,
        }
    }
}

/// Best trial per objective in a summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestSummary {
    pub ordinal: u64,
    pub value: f64,
    pub configuration: Configuration,
}

/// Compact, serializable digest of a session for reporting and export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub strategy: String,
    pub status: SessionStatus,
    pub termination: Option<TerminationReason>,
    pub max_trials: MaxTrials,
    pub space_size: u64,
    pub trials_issued: usize,
    pub completed: u64,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub primary_objective: String,
    pub best_configuration: Option<Configuration>,
    pub best: BTreeMap<String, BestSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objective::{Metrics, Objective};
    use std::time::Duration;

    fn space() -> Arc<ConfigurationSpace> {
        Arc::new(
            ConfigurationSpace::builder()
                .categorical("model", ["A", "B"])
                .continuous("temperature", [0.0, 0.5])
                .build()
                .unwrap(),
        )
    }

    fn trial(
        space: &ConfigurationSpace,
        ordinal: u64,
        index: u64,
        accuracy: Option<f64>,
    ) -> TrialRecord {
        let metrics = accuracy.map(|a| {
            let mut m = Metrics::new();
            m.insert("accuracy".into(), a);
            m.insert("cost".into(), 1.0 / (ordinal as f64));
            m
        });
        TrialRecord {
            ordinal,
            configuration: space.configuration_at(index).unwrap(),
            status: if metrics.is_some() {
                TrialStatus::Succeeded
            } else {
                TrialStatus::Failed
            },
            metrics,
            duration: Duration::from_millis(10),
            started_at: Utc::now(),
            examples_total: 1,
            failures: Vec::new(),
        }
    }

    fn session(max_trials: MaxTrials) -> SessionState {
        let objectives = ObjectiveSet::new(vec![Objective::accuracy(), Objective::cost()]).unwrap();
        SessionState::new(space(), "grid", objectives, max_trials)
    }

    #[test]
    fn max_trials_normalization() {
        assert_eq!(MaxTrials::new(None).unwrap(), MaxTrials::Unbounded);
        assert_eq!(MaxTrials::new(Some(3)).unwrap().limit(), Some(3));
        assert_eq!(
            MaxTrials::new(Some(0)).unwrap_err(),
            ConfigurationError::InvalidMaxTrials(0)
        );
        assert!(!MaxTrials::Unbounded.is_reached(u64::MAX));
        assert!(MaxTrials::limited(2).unwrap().is_reached(2));
        assert!(!MaxTrials::limited(2).unwrap().is_reached(1));
    }

    #[test]
    fn max_trials_wire_form_is_never_null() {
        assert_eq!(
            serde_json::to_value(MaxTrials::Unbounded).unwrap(),
            serde_json::json!("unbounded")
        );
        assert_eq!(
            serde_json::to_value(MaxTrials::limited(5).unwrap()).unwrap(),
            serde_json::json!({"limited": 5})
        );
    }

    #[test]
    fn lenient_max_trials_accepts_count_null_and_missing() {
        #[derive(Deserialize)]
        struct Settings {
            #[serde(default, with = "lenient_max_trials")]
            max_trials: MaxTrials,
        }

        let s: Settings = serde_json::from_str(r#"{"max_trials": 10}"#).unwrap();
        assert_eq!(s.max_trials.limit(), Some(10));
        let s: Settings = serde_json::from_str(r#"{"max_trials": null}"#).unwrap();
        assert_eq!(s.max_trials, MaxTrials::Unbounded);
        let s: Settings = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(s.max_trials, MaxTrials::Unbounded);
        let s: Settings = serde_json::from_str(r#"{"max_trials": "unbounded"}"#).unwrap();
        assert_eq!(s.max_trials, MaxTrials::Unbounded);
        assert!(serde_json::from_str::<Settings>(r#"{"max_trials": 0}"#).is_err());
    }

    #[test]
    fn session_lifecycle() {
        let mut state = session(MaxTrials::limited(2).unwrap());
        assert_eq!(state.status(), SessionStatus::Created);

        let space = state.space().clone();
        assert_eq!(
            state.record(trial(&space, 1, 0, Some(0.5))).unwrap_err(),
            SessionError::NotRunning
        );

        state.start().unwrap();
        assert!(state.started_at().is_some());
        state.record(trial(&space, 1, 0, Some(0.5))).unwrap();
        state.record(trial(&space, 2, 1, None)).unwrap();
        assert_eq!(state.completed_count(), 2);
        assert!(state.max_trials_reached());

        state.terminate(TerminationReason::MaxTrialsReached).unwrap();
        assert_eq!(state.status(), SessionStatus::Completed);
        assert!(state.finished_at().is_some());

        assert_eq!(
            state.record(trial(&space, 3, 2, Some(0.9))).unwrap_err(),
            SessionError::Terminal
        );
        assert_eq!(
            state.terminate(TerminationReason::Cancelled).unwrap_err(),
            SessionError::Terminal
        );
        assert_eq!(state.trials().len(), 2);
    }

    #[test]
    fn ordinals_must_be_sequential() {
        let mut state = session(MaxTrials::Unbounded);
        let space = state.space().clone();
        state.start().unwrap();
        let err = state.record(trial(&space, 2, 0, Some(0.1))).unwrap_err();
        assert_eq!(err, SessionError::OrdinalOutOfOrder { expected: 1, got: 2 });
    }

    #[test]
    fn best_so_far_is_monotonic_per_direction() {
        let mut state = session(MaxTrials::Unbounded);
        let space = state.space().clone();
        state.start().unwrap();

        let scores = [0.4, 0.7, 0.2, 0.7, 0.9, 0.1];
        let mut previous = f64::NEG_INFINITY;
        for (i, score) in scores.iter().enumerate() {
            let ordinal = i as u64 + 1;
            state
                .record(trial(&space, ordinal, i as u64 % 4, Some(*score)))
                .unwrap();
            let best = state.best_value("accuracy").unwrap();
            assert!(best >= previous);
            previous = best;
            if ordinal == 4 {
                // Ties keep the earliest trial.
                assert_eq!(state.best("accuracy").unwrap().ordinal, 2);
            }
        }

        assert_eq!(state.best("accuracy").unwrap().ordinal, 5);
        // cost = 1/ordinal, minimized: the last trial wins.
        assert_eq!(state.best("cost").unwrap().ordinal, 6);
        assert_eq!(
            state.best_configuration(),
            Some(&space.configuration_at(0).unwrap())
        );
    }

    #[test]
    fn failed_trials_never_become_best() {
        let mut state = session(MaxTrials::Unbounded);
        let space = state.space().clone();
        state.start().unwrap();
        state.record(trial(&space, 1, 0, None)).unwrap();
        assert!(state.best_trial("accuracy").is_none());
        assert_eq!(state.count_with_status(TrialStatus::Failed), 1);
        assert!(state.has_executed(&space.configuration_at(0).unwrap()));
    }

    #[test]
    fn non_finite_scores_never_become_best() {
        let mut state = session(MaxTrials::Unbounded);
        let space = state.space().clone();
        state.start().unwrap();
        state.record(trial(&space, 1, 0, Some(f64::NAN))).unwrap();
        assert!(state.best_trial("accuracy").is_none());
        assert!(state.best_configuration().is_none());

        state.record(trial(&space, 2, 1, Some(0.9))).unwrap();
        assert_eq!(state.best_value("accuracy"), Some(0.9));
        assert_eq!(state.best_trial("accuracy").unwrap().ordinal, 2);
        assert_eq!(
            state.best_configuration(),
            Some(&space.configuration_at(1).unwrap())
        );
    }

    #[test]
    fn skipped_trials_do_not_count() {
        let mut state = session(MaxTrials::limited(1).unwrap());
        let space = state.space().clone();
        state.start().unwrap();
        state
            .record(TrialRecord::skipped(1, space.configuration_at(0).unwrap()))
            .unwrap();
        assert_eq!(state.completed_count(), 0);
        assert!(!state.max_trials_reached());
        assert!(!state.has_executed(&space.configuration_at(0).unwrap()));
    }

    #[test]
    fn summary_reports_best_per_objective() {
        let mut state = session(MaxTrials::Unbounded);
        let space = state.space().clone();
        state.start().unwrap();
        state.record(trial(&space, 1, 3, Some(0.8))).unwrap();
        state.record(trial(&space, 2, 1, Some(0.6))).unwrap();
        state.terminate(TerminationReason::Exhausted).unwrap();

        let summary = state.summary();
        assert_eq!(summary.status, SessionStatus::Exhausted);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.space_size, 4);
        assert_eq!(summary.best["accuracy"].ordinal, 1);
        assert_eq!(summary.best["cost"].ordinal, 2);
        assert_eq!(summary.best_configuration, space.configuration_at(3));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["termination"]["reason"], "exhausted");
        assert_eq!(json["max_trials"], "unbounded");
    }

    #[test]
    fn cancellation_maps_to_stopped_early() {
        assert_eq!(TerminationReason::Cancelled.status(), SessionStatus::StoppedEarly);
        assert_eq!(TerminationReason::Cancelled.code(), "cancelled");
        let reason = TerminationReason::EarlyStopped {
            message: "no improvement".into(),
        };
        assert_eq!(reason.status(), SessionStatus::StoppedEarly);
        assert_eq!(reason.to_string(), "early_stopped: no improvement");
    }
}
