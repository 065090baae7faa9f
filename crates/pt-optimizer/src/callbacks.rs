//! Progress callbacks invoked by the orchestrator in issuance order.

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use pt_types::{
    Configuration, MaxTrials, SessionId, SessionState, SessionSummary, TrialRecord, TrialStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Observer of a running session. All hooks are synchronous and default to
/// no-ops; a slow callback delays the next trial.
pub trait ProgressCallback: Send {
    fn on_session_start(&mut self, _session: &SessionState) {}

    /// Called for every issued ordinal, including re-suggestions that end up
    /// skipped, so each `on_trial_end` has a matching start.
    fn on_trial_start(&mut self, _ordinal: u64, _configuration: &Configuration) {}

    /// Called after the trial has been appended to `session`.
    fn on_trial_end(&mut self, _trial: &TrialRecord, _session: &SessionState) {}

    fn on_session_end(&mut self, _session: &SessionState) {}
}

/// Logs progress through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingCallback;

impl ProgressCallback for LoggingCallback {
    fn on_session_start(&mut self, session: &SessionState) {
        info!(
            session = %session.id(),
            strategy = session.strategy(),
            space_size = session.space().size(),
            max_trials = %session.max_trials(),
            "optimization started"
        );
    }

    fn on_trial_start(&mut self, ordinal: u64, configuration: &Configuration) {
        debug!(ordinal, configuration = %configuration, "trial started");
    }

    fn on_trial_end(&mut self, trial: &TrialRecord, session: &SessionState) {
        let primary = &session.objectives().primary().name;
        info!(
            session = %session.id(),
            ordinal = trial.ordinal,
            status = ?trial.status,
            score = ?trial.metric(primary),
            best = ?session.best_value(primary),
            duration_ms = trial.duration.as_millis() as u64,
            "trial finished"
        );
    }

    fn on_session_end(&mut self, session: &SessionState) {
        info!(
            session = %session.id(),
            status = ?session.status(),
            completed = session.completed_count(),
            best = ?session.best_configuration().map(|c| c.to_string()),
            "optimization finished"
        );
    }
}

/// Aggregate counters over a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialStatistics {
    pub trials: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_duration: Duration,
    pub best_score: Option<f64>,
}

impl TrialStatistics {
    /// Succeeded over executed trials; `0.0` before any trial ran.
    pub fn success_rate(&self) -> f64 {
        let executed = self.succeeded + self.failed;
        if executed == 0 {
            0.0
        } else {
            self.succeeded as f64 / executed as f64
        }
    }

    pub fn mean_duration(&self) -> Duration {
        let executed = (self.succeeded + self.failed) as u32;
        if executed == 0 {
            Duration::ZERO
        } else {
            self.total_duration / executed
        }
    }
}

/// Collects [`TrialStatistics`]. Clones share the same counters, so keep one
/// and hand another to the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct StatisticsCallback {
    stats: Arc<Mutex<TrialStatistics>>,
}

impl StatisticsCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TrialStatistics {
        self.stats.lock().clone()
    }
}

impl ProgressCallback for StatisticsCallback {
    fn on_session_start(&mut self, _session: &SessionState) {
        *self.stats.lock() = TrialStatistics::default();
    }

    fn on_trial_end(&mut self, trial: &TrialRecord, session: &SessionState) {
        let mut stats = self.stats.lock();
        stats.trials += 1;
        match trial.status {
            TrialStatus::Succeeded => stats.succeeded += 1,
            TrialStatus::Failed => stats.failed += 1,
            TrialStatus::Skipped => stats.skipped += 1,
        }
        stats.total_duration += trial.duration;
        stats.best_score = session.best_value(&session.objectives().primary().name);
    }
}

/// Event forwarded by [`ChannelCallback`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    SessionStarted {
        session_id: SessionId,
        space_size: u64,
        max_trials: MaxTrials,
    },
    TrialStarted {
        ordinal: u64,
        configuration: Configuration,
    },
    TrialFinished {
        session_id: SessionId,
        trial: TrialRecord,
        best: Option<f64>,
    },
    SessionFinished {
        summary: SessionSummary,
    },
}

/// Forwards [`ProgressEvent`]s to a telemetry consumer. A disconnected
/// receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelCallback {
    tx: Sender<ProgressEvent>,
}

impl ChannelCallback {
    pub fn new(tx: Sender<ProgressEvent>) -> Self {
        Self { tx }
    }

    fn emit(&self, event: ProgressEvent) {
        if self.tx.send(event).is_err() {
            debug!("progress receiver dropped");
        }
    }
}

impl ProgressCallback for ChannelCallback {
    fn on_session_start(&mut self, session: &SessionState) {
        self.emit(ProgressEvent::SessionStarted {
            session_id: session.id(),
            space_size: session.space().size(),
            max_trials: session.max_trials(),
        });
    }

    fn on_trial_start(&mut self, ordinal: u64, configuration: &Configuration) {
        self.emit(ProgressEvent::TrialStarted {
            ordinal,
            configuration: configuration.clone(),
        });
    }

    fn on_trial_end(&mut self, trial: &TrialRecord, session: &SessionState) {
        self.emit(ProgressEvent::TrialFinished {
            session_id: session.id(),
            trial: trial.clone(),
            best: session.best_value(&session.objectives().primary().name),
        });
    }

    fn on_session_end(&mut self, session: &SessionState) {
        self.emit(ProgressEvent::SessionFinished {
            summary: session.summary(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pt_types::{ConfigurationSpace, Metrics, ObjectiveSet, TerminationReason};

    fn running_session() -> SessionState {
        let space = ConfigurationSpace::builder()
            .categorical("model", ["A", "B", "C"])
            .build()
            .unwrap();
        let mut state = SessionState::new(
            Arc::new(space),
            "grid",
            ObjectiveSet::default(),
            MaxTrials::Unbounded,
        );
        state.start().unwrap();
        state
    }

    fn finished(state: &SessionState, accuracy: Option<f64>, millis: u64) -> TrialRecord {
        let ordinal = state.next_ordinal();
        let config = state.space().configuration_at(ordinal - 1).unwrap();
        let mut trial = TrialRecord::skipped(ordinal, config);
        trial.examples_total = 1;
        trial.duration = Duration::from_millis(millis);
        trial.status = match accuracy {
            Some(a) => {
                trial.metrics = Some(Metrics::from([("accuracy".to_string(), a)]));
                TrialStatus::Succeeded
            }
            None => TrialStatus::Failed,
        };
        trial
    }

    #[test]
    fn statistics_track_counts_and_best() {
        let mut state = running_session();
        let stats = StatisticsCallback::new();
        let mut callback = stats.clone();
        callback.on_session_start(&state);

        for (accuracy, millis) in [(Some(0.4), 100), (None, 300), (Some(0.9), 200)] {
            let trial = finished(&state, accuracy, millis);
            state.record(trial.clone()).unwrap();
            callback.on_trial_end(&trial, &state);
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.trials, 3);
        assert_eq!(snapshot.succeeded, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.best_score, Some(0.9));
        assert!((snapshot.success_rate() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(snapshot.mean_duration(), Duration::from_millis(200));
    }

    #[test]
    fn empty_statistics() {
        let stats = TrialStatistics::default();
        assert_eq!(stats.success_rate(), 0.0);
        assert_eq!(stats.mean_duration(), Duration::ZERO);
    }

    #[test]
    fn channel_forwards_events_in_order() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut callback = ChannelCallback::new(tx);
        let mut state = running_session();

        callback.on_session_start(&state);
        let trial = finished(&state, Some(0.5), 10);
        callback.on_trial_start(trial.ordinal, &trial.configuration);
        state.record(trial.clone()).unwrap();
        callback.on_trial_end(&trial, &state);
        state.terminate(TerminationReason::Exhausted).unwrap();
        callback.on_session_end(&state);

        let events: Vec<ProgressEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], ProgressEvent::SessionStarted { space_size: 3, .. }));
        assert!(matches!(events[1], ProgressEvent::TrialStarted { ordinal: 1, .. }));
        assert!(matches!(
            events[2],
            ProgressEvent::TrialFinished { best: Some(b), .. } if b == 0.5
        ));
        assert!(matches!(events[3], ProgressEvent::SessionFinished { .. }));
    }

    #[test]
    fn channel_ignores_dropped_receiver() {
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(rx);
        let mut callback = ChannelCallback::new(tx);
        callback.on_session_start(&running_session());
    }
}
