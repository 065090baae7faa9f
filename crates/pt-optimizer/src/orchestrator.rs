//! Session orchestration: suggest, execute, record, decide, repeat.

use pt_remote::{RemoteBackend, RemoteMirror, RemoteMirrorState};
use pt_types::{
    config_error, lenient_max_trials, ConfigurationError, ConfigurationSpace, MaxTrials,
    ObjectiveSet, PtResult, SessionState, TerminationReason, TrialRecord,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::callbacks::ProgressCallback;
use crate::executor::{Dataset, ExecutorConfig, TrialExecutor};
use crate::search::{GuidedConfig, SearchStrategy, StrategyKind, Suggestion};
use crate::stopping::{EarlyStopping, EarlyStoppingPolicy};

/// Settings for one optimization run.
///
/// `max_trials` may be an integer, `null` or absent in settings files; the
/// latter two mean unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationSettings {
    #[serde(with = "lenient_max_trials")]
    pub max_trials: MaxTrials,
    pub strategy: StrategyKind,
    pub objectives: ObjectiveSet,
    pub seed: Option<u64>,
    pub guided: GuidedConfig,
    pub executor: ExecutorConfig,
    pub early_stopping: EarlyStopping,
    pub remote_timeout_ms: u64,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            max_trials: MaxTrials::Unbounded,
            strategy: StrategyKind::Grid,
            objectives: ObjectiveSet::default(),
            seed: None,
            guided: GuidedConfig::default(),
            executor: ExecutorConfig::default(),
            early_stopping: EarlyStopping::Never,
            remote_timeout_ms: 10_000,
        }
    }
}

impl OptimizationSettings {
    pub fn with_max_trials(mut self, max_trials: MaxTrials) -> Self {
        self.max_trials = max_trials;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_objectives(mut self, objectives: ObjectiveSet) -> Self {
        self.objectives = objectives;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_guided(mut self, guided: GuidedConfig) -> Self {
        self.guided = guided;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_early_stopping(mut self, early_stopping: EarlyStopping) -> Self {
        self.early_stopping = early_stopping;
        self
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Parse a settings document and validate it.
    pub fn from_json(raw: &str) -> Result<Self, ConfigurationError> {
        let settings: Self =
            serde_json::from_str(raw).map_err(|e| config_error!("invalid settings: {e}"))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings no session could run with.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.executor.max_concurrency == 0 {
            return Err(config_error!("executor.max_concurrency must be at least 1"));
        }
        if self.executor.call_timeout_ms == 0 {
            return Err(config_error!("executor.call_timeout_ms must be positive"));
        }
        if !self.guided.exploration.is_finite() || self.guided.exploration < 0.0 {
            return Err(config_error!(
                "guided.exploration must be a non-negative number, got {}",
                self.guided.exploration
            ));
        }
        if let Some(margin) = self.guided.confidence_margin {
            if !margin.is_finite() {
                return Err(config_error!("guided.confidence_margin must be finite"));
            }
        }
        if self.remote_timeout_ms == 0 {
            return Err(config_error!("remote_timeout_ms must be positive"));
        }
        Ok(())
    }
}

/// Cooperative stop signal, checked between trials.
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Drives one session to a terminal state.
///
/// Trials run strictly one after another. After each append the session is
/// checked, in order, for a reached trial budget, the early-stopping policy
/// and cancellation. The remote mirror, when attached, only ever observes.
pub struct Orchestrator {
    space: Arc<ConfigurationSpace>,
    dataset: Dataset,
    executor: TrialExecutor,
    strategy: Box<dyn SearchStrategy>,
    settings: OptimizationSettings,
    early_stopping: Box<dyn EarlyStoppingPolicy>,
    callbacks: Vec<Box<dyn ProgressCallback>>,
    mirror: Option<RemoteMirror>,
    cancellation: CancellationHandle,
}

impl Orchestrator {
    pub fn new(
        space: Arc<ConfigurationSpace>,
        dataset: Dataset,
        executor: TrialExecutor,
        strategy: Box<dyn SearchStrategy>,
        settings: OptimizationSettings,
    ) -> Self {
        let early_stopping = settings.early_stopping.clone().into_policy();
        Self {
            space,
            dataset,
            executor,
            strategy,
            settings,
            early_stopping,
            callbacks: Vec::new(),
            mirror: None,
            cancellation: CancellationHandle::new(),
        }
    }

    /// Overrides the policy named in the settings.
    pub fn with_early_stopping(mut self, policy: impl EarlyStoppingPolicy + 'static) -> Self {
        self.early_stopping = Box::new(policy);
        self
    }

    pub fn with_callback(mut self, callback: impl ProgressCallback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    pub fn with_callbacks(mut self, callbacks: Vec<Box<dyn ProgressCallback>>) -> Self {
        self.callbacks.extend(callbacks);
        self
    }

    /// Mirror the session to `backend`, bounded by the settings' remote timeout.
    pub fn with_remote(mut self, backend: Arc<dyn RemoteBackend>) -> Self {
        self.mirror =
            Some(RemoteMirror::new(backend).with_timeout(self.settings.remote_timeout()));
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationHandle) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.cancellation.clone()
    }

    /// Mirror bookkeeping of the last run, if a remote is attached.
    pub fn mirror_state(&self) -> Option<&RemoteMirrorState> {
        self.mirror.as_ref().map(RemoteMirror::state)
    }

    /// Run a fresh session to completion and return its terminal state.
    pub async fn run(&mut self) -> SessionState {
        let mut session = SessionState::new(
            Arc::clone(&self.space),
            self.strategy.name(),
            self.settings.objectives.clone(),
            self.settings.max_trials,
        );
        info!(
            session = %session.id(),
            strategy = session.strategy(),
            space_size = self.space.size(),
            max_trials = %session.max_trials(),
            examples = self.dataset.len(),
            "session created"
        );

        if let Some(mirror) = self.mirror.as_mut() {
            mirror.create_session(&session).await;
        }
        for callback in &mut self.callbacks {
            callback.on_session_start(&session);
        }

        let reason = match self.drive(&mut session).await {
            Ok(reason) => reason,
            Err(e) => {
                error!(session = %session.id(), error = %e, "session failed");
                TerminationReason::InfrastructureFailure {
                    message: e.to_string(),
                }
            }
        };
        if let Err(e) = session.terminate(reason) {
            warn!(session = %session.id(), error = %e, "session already terminal");
        }

        info!(
            session = %session.id(),
            status = ?session.status(),
            completed = session.completed_count(),
            trials = session.trials().len(),
            best = ?session.best_configuration().map(|c| c.to_string()),
            "session finished"
        );

        if let Some(mirror) = self.mirror.as_mut() {
            mirror.finalize(&session).await;
        }
        for callback in &mut self.callbacks {
            callback.on_session_end(&session);
        }
        session
    }

    async fn drive(&mut self, session: &mut SessionState) -> PtResult<TerminationReason> {
        session.start()?;
        let mut skipped = 0u64;

        loop {
            if self.cancellation.is_cancelled() {
                return Ok(TerminationReason::Cancelled);
            }

            let configuration = match self.strategy.suggest(session.trials()) {
                Suggestion::Next(configuration) => configuration,
                Suggestion::Exhausted => return Ok(TerminationReason::Exhausted),
            };
            let ordinal = session.next_ordinal();
            for callback in &mut self.callbacks {
                callback.on_trial_start(ordinal, &configuration);
            }

            if session.has_executed(&configuration) {
                skipped += 1;
                warn!(
                    session = %session.id(),
                    ordinal,
                    configuration = %configuration,
                    "strategy repeated an executed configuration, skipping"
                );
                let record = TrialRecord::skipped(ordinal, configuration);
                session.record(record.clone())?;
                self.trial_finished(&record, session).await;
                if skipped > self.space.size() {
                    return Ok(TerminationReason::Exhausted);
                }
                continue;
            }

            debug!(
                session = %session.id(),
                ordinal,
                configuration = %configuration,
                "trial issued"
            );

            let record = self
                .executor
                .run(ordinal, &configuration, &self.dataset)
                .await?;
            self.strategy
                .report(&record.configuration, record.metrics.as_ref());
            session.record(record.clone())?;
            self.trial_finished(&record, session).await;

            if session.max_trials_reached() {
                return Ok(TerminationReason::MaxTrialsReached);
            }
            if let Some(message) = self.early_stopping.should_stop(session) {
                return Ok(TerminationReason::EarlyStopped { message });
            }
            if self.cancellation.is_cancelled() {
                return Ok(TerminationReason::Cancelled);
            }
        }
    }

    async fn trial_finished(&mut self, trial: &TrialRecord, session: &SessionState) {
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.report_trial(trial).await;
        }
        for callback in &mut self.callbacks {
            callback.on_trial_end(trial, session);
        }
    }
}

/// Everything [`optimize`] needs.
pub struct OptimizeRequest {
    pub space: ConfigurationSpace,
    pub dataset: Dataset,
    pub executor: TrialExecutor,
    pub settings: OptimizationSettings,
    pub callbacks: Vec<Box<dyn ProgressCallback>>,
    pub remote: Option<Arc<dyn RemoteBackend>>,
    pub cancellation: Option<CancellationHandle>,
}

impl OptimizeRequest {
    pub fn new(space: ConfigurationSpace, dataset: Dataset, executor: TrialExecutor) -> Self {
        Self {
            space,
            dataset,
            executor,
            settings: OptimizationSettings::default(),
            callbacks: Vec::new(),
            remote: None,
            cancellation: None,
        }
    }

    pub fn with_settings(mut self, settings: OptimizationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_callback(mut self, callback: impl ProgressCallback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    pub fn with_remote(mut self, backend: Arc<dyn RemoteBackend>) -> Self {
        self.remote = Some(backend);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationHandle) -> Self {
        self.cancellation = Some(cancellation);
        self
    }
}

/// Validate the request, build the configured strategy and run one session.
///
/// `settings.executor` replaces whatever config the executor was built with.
/// Only configuration problems are returned as `Err`; everything that goes
/// wrong after the session starts is reported in the returned state.
pub async fn optimize(request: OptimizeRequest) -> Result<SessionState, ConfigurationError> {
    let OptimizeRequest {
        space,
        dataset,
        executor,
        settings,
        callbacks,
        remote,
        cancellation,
    } = request;

    settings.validate()?;

    let space = Arc::new(space);
    let strategy = settings.strategy.build(
        Arc::clone(&space),
        settings.objectives.primary().clone(),
        settings.seed,
        settings.max_trials.limit(),
        settings.guided.clone(),
    );
    let executor = executor.with_config(settings.executor.clone());

    let mut orchestrator = Orchestrator::new(space, dataset, executor, strategy, settings)
        .with_callbacks(callbacks);
    if let Some(backend) = remote {
        orchestrator = orchestrator.with_remote(backend);
    }
    if let Some(cancellation) = cancellation {
        orchestrator = orchestrator.with_cancellation(cancellation);
    }

    Ok(orchestrator.run().await)
}

/// Upper bound on callable invocations for a run.
pub fn estimate_calls(
    space: &ConfigurationSpace,
    max_trials: MaxTrials,
    dataset_len: usize,
) -> u64 {
    let trials = max_trials
        .limit()
        .map_or(space.size(), |limit| limit.min(space.size()));
    trials.saturating_mul(dataset_len as u64)
}
