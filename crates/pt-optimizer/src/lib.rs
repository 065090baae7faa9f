//! # pt-optimizer
//!
//! Trial generation, execution and session orchestration for Prompttune.
//!
//! Provides the search strategies (grid, random, guided), the trial executor
//! that runs a callable over a dataset, early-stopping policies, progress
//! callbacks and the [`Orchestrator`] that ties them into a session, plus the
//! [`optimize`] convenience entry point.

mod callbacks;
mod executor;
mod orchestrator;
mod search;
mod stopping;

pub use callbacks::{
    ChannelCallback, LoggingCallback, ProgressCallback, ProgressEvent, StatisticsCallback,
    TrialStatistics,
};
pub use executor::{
    Aggregator, Dataset, Evaluator, ExactMatch, Example, ExecutorConfig, MeanAggregator,
    TrialCallable, TrialExecutor, LATENCY_METRIC,
};
pub use orchestrator::{
    estimate_calls, optimize, CancellationHandle, OptimizationSettings, OptimizeRequest,
    Orchestrator,
};
pub use search::{
    GridSearch, GuidedConfig, GuidedSearch, RandomSearch, SearchStrategy, StrategyKind, Suggestion,
};
pub use stopping::{EarlyStopping, EarlyStoppingPolicy, NeverStop, Patience, TargetScore};
