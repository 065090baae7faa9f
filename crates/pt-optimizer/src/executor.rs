//! Trial execution: run one configuration against every dataset example.

use async_trait::async_trait;
use chrono::Utc;
use pt_types::{
    Configuration, ExampleFailure, Metrics, TrialExecutionError, TrialInfrastructureError,
    TrialRecord, TrialStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Metric filled from the measured call time when the evaluator omits it.
pub const LATENCY_METRIC: &str = "latency";

/// One `(input, expected)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub input: Value,
    pub expected: Value,
}

impl Example {
    pub fn new(input: impl Into<Value>, expected: impl Into<Value>) -> Self {
        Self {
            input: input.into(),
            expected: expected.into(),
        }
    }
}

/// Immutable, cheaply cloneable list of examples.
#[derive(Debug, Clone)]
pub struct Dataset {
    examples: Arc<[Example]>,
}

impl Dataset {
    pub fn new(examples: Vec<Example>) -> Self {
        Self {
            examples: examples.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Example> {
        self.examples.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Example> {
        self.examples.iter()
    }
}

impl FromIterator<Example> for Dataset {
    fn from_iter<I: IntoIterator<Item = Example>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// The unit under optimization, typically an LLM-backed function.
///
/// Any `Fn(Configuration, Value) -> impl Future<Output = Result<Value, String>>`
/// closure implements this trait.
#[async_trait]
pub trait TrialCallable: Send + Sync {
    async fn call(&self, configuration: &Configuration, input: &Value) -> Result<Value, String>;
}

#[async_trait]
impl<F, Fut> TrialCallable for F
where
    F: Fn(Configuration, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, String>> + Send,
{
    async fn call(&self, configuration: &Configuration, input: &Value) -> Result<Value, String> {
        (self)(configuration.clone(), input.clone()).await
    }
}

/// Scores one output against its expected value.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, output: &Value, expected: &Value) -> Result<Metrics, String>;
}

impl<F> Evaluator for F
where
    F: Fn(&Value, &Value) -> Result<Metrics, String> + Send + Sync,
{
    fn evaluate(&self, output: &Value, expected: &Value) -> Result<Metrics, String> {
        (self)(output, expected)
    }
}

/// `accuracy` = 1.0 when the output equals the expected value, else 0.0.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatch;

impl Evaluator for ExactMatch {
    fn evaluate(&self, output: &Value, expected: &Value) -> Result<Metrics, String> {
        let score = if output == expected { 1.0 } else { 0.0 };
        Ok(Metrics::from([("accuracy".to_string(), score)]))
    }
}

/// Folds per-example metrics (in dataset order) into trial metrics.
pub trait Aggregator: Send + Sync {
    fn aggregate(&self, per_example: &[Metrics]) -> Metrics;
}

/// Arithmetic mean of each metric over the examples that report it.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanAggregator;

impl Aggregator for MeanAggregator {
    fn aggregate(&self, per_example: &[Metrics]) -> Metrics {
        let mut sums: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
        for metrics in per_example {
            for (name, value) in metrics {
                let entry = sums.entry(name.as_str()).or_insert((0.0, 0));
                entry.0 += value;
                entry.1 += 1;
            }
        }
        sums.into_iter()
            .map(|(name, (sum, count))| (name.to_string(), sum / count as f64))
            .collect()
    }
}

/// Executor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Per-call timeout in milliseconds. Must be positive.
    pub call_timeout_ms: u64,
    /// Examples evaluated concurrently within one trial.
    pub max_concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 60_000,
            max_concurrency: 1,
        }
    }
}

impl ExecutorConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

type ExampleOutcome = Result<Metrics, TrialExecutionError>;

/// Runs a configuration over a dataset and produces a [`TrialRecord`].
///
/// Example-level failures are recorded on the record and excluded from the
/// aggregate; only an empty dataset or a broken runtime is an `Err`.
#[derive(Clone)]
pub struct TrialExecutor {
    callable: Arc<dyn TrialCallable>,
    evaluator: Arc<dyn Evaluator>,
    aggregator: Arc<dyn Aggregator>,
    config: ExecutorConfig,
}

impl TrialExecutor {
    pub fn new(
        callable: impl TrialCallable + 'static,
        evaluator: impl Evaluator + 'static,
    ) -> Self {
        Self {
            callable: Arc::new(callable),
            evaluator: Arc::new(evaluator),
            aggregator: Arc::new(MeanAggregator),
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_aggregator(mut self, aggregator: impl Aggregator + 'static) -> Self {
        self.aggregator = Arc::new(aggregator);
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub async fn run(
        &self,
        ordinal: u64,
        configuration: &Configuration,
        dataset: &Dataset,
    ) -> Result<TrialRecord, TrialInfrastructureError> {
        if dataset.is_empty() {
            return Err(TrialInfrastructureError::EmptyDataset);
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        let window = self.config.max_concurrency.max(1);

        let mut pending: VecDeque<JoinHandle<ExampleOutcome>> = VecDeque::with_capacity(window);
        let mut outcomes: Vec<ExampleOutcome> = Vec::with_capacity(dataset.len());

        for example in dataset.iter() {
            if pending.len() >= window {
                if let Some(handle) = pending.pop_front() {
                    outcomes.push(resolve(handle.await)?);
                }
            }
            pending.push_back(tokio::spawn(evaluate_example(
                Arc::clone(&self.callable),
                Arc::clone(&self.evaluator),
                configuration.clone(),
                example.clone(),
                self.config.call_timeout(),
            )));
        }
        while let Some(handle) = pending.pop_front() {
            outcomes.push(resolve(handle.await)?);
        }

        let mut scored = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(metrics) => scored.push(metrics),
                Err(error) => {
                    debug!(ordinal, example = index, error = %error, "example failed");
                    failures.push(ExampleFailure { index, error });
                }
            }
        }

        let (status, metrics) = if scored.is_empty() {
            warn!(ordinal, configuration = %configuration, "every example failed");
            (TrialStatus::Failed, None)
        } else {
            (TrialStatus::Succeeded, Some(self.aggregator.aggregate(&scored)))
        };

        Ok(TrialRecord {
            ordinal,
            configuration: configuration.clone(),
            status,
            metrics,
            duration: clock.elapsed(),
            started_at,
            examples_total: dataset.len(),
            failures,
        })
    }
}

async fn evaluate_example(
    callable: Arc<dyn TrialCallable>,
    evaluator: Arc<dyn Evaluator>,
    configuration: Configuration,
    example: Example,
    timeout: Duration,
) -> ExampleOutcome {
    let started = Instant::now();
    let call = callable.call(&configuration, &example.input);
    let output = tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| TrialExecutionError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        })?
        .map_err(TrialExecutionError::Callable)?;
    let elapsed = started.elapsed();

    let mut metrics = evaluator
        .evaluate(&output, &example.expected)
        .map_err(TrialExecutionError::Evaluator)?;
    if let Some((name, value)) = metrics.iter().find(|(_, v)| !v.is_finite()) {
        return Err(TrialExecutionError::Evaluator(format!(
            "metric '{name}' is not finite: {value}"
        )));
    }
    metrics
        .entry(LATENCY_METRIC.to_string())
        .or_insert(elapsed.as_secs_f64());
    Ok(metrics)
}

/// Panics become example failures; a cancelled task means the runtime is
/// shutting down.
fn resolve(
    joined: Result<ExampleOutcome, tokio::task::JoinError>,
) -> Result<ExampleOutcome, TrialInfrastructureError> {
    match joined {
        Ok(outcome) => Ok(outcome),
        Err(e) if e.is_panic() => Ok(Err(TrialExecutionError::Panicked(panic_message(
            e.into_panic(),
        )))),
        Err(e) => Err(TrialInfrastructureError::Runtime(e.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pt_types::ConfigurationSpace;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> Configuration {
        ConfigurationSpace::builder()
            .categorical("model", ["A", "B"])
            .build()
            .unwrap()
            .configuration_at(0)
            .unwrap()
    }

    fn echo_executor() -> TrialExecutor {
        TrialExecutor::new(
            |_: Configuration, input: Value| async move { Ok::<_, String>(input) },
            ExactMatch,
        )
    }

    fn labelled(pairs: &[(&str, &str)]) -> Dataset {
        pairs
            .iter()
            .map(|(input, expected)| Example::new(*input, *expected))
            .collect()
    }

    #[tokio::test]
    async fn mean_accuracy_over_examples() {
        let dataset = labelled(&[("a", "a"), ("b", "b"), ("c", "c"), ("d", "x")]);
        let record = echo_executor().run(1, &config(), &dataset).await.unwrap();

        assert_eq!(record.status, TrialStatus::Succeeded);
        assert_eq!(record.metric("accuracy"), Some(0.75));
        assert_eq!(record.examples_total, 4);
        assert!(record.failures.is_empty());
    }

    #[tokio::test]
    async fn failed_examples_are_excluded() {
        let executor = TrialExecutor::new(
            |_: Configuration, input: Value| async move {
                if input == json!("bad") {
                    Err("provider error".to_string())
                } else {
                    Ok(input)
                }
            },
            ExactMatch,
        );
        let dataset = labelled(&[("a", "a"), ("bad", "bad"), ("c", "z")]);
        let record = executor.run(1, &config(), &dataset).await.unwrap();

        assert_eq!(record.status, TrialStatus::Succeeded);
        assert_eq!(record.metric("accuracy"), Some(0.5));
        assert_eq!(record.failures.len(), 1);
        assert_eq!(record.failures[0].index, 1);
        assert_eq!(
            record.failures[0].error,
            TrialExecutionError::Callable("provider error".to_string())
        );
        assert_eq!(record.examples_succeeded(), 2);
    }

    #[tokio::test]
    async fn all_examples_failing_fails_the_trial() {
        let executor = TrialExecutor::new(
            |_: Configuration, _: Value| async move { Err::<Value, _>("down".to_string()) },
            ExactMatch,
        );
        let record = executor
            .run(3, &config(), &labelled(&[("a", "a"), ("b", "b")]))
            .await
            .unwrap();

        assert_eq!(record.ordinal, 3);
        assert_eq!(record.status, TrialStatus::Failed);
        assert!(record.metrics.is_none());
        assert_eq!(record.failures.len(), 2);
    }

    #[tokio::test]
    async fn empty_dataset_is_an_infrastructure_error() {
        let err = echo_executor()
            .run(1, &config(), &Dataset::new(Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err, TrialInfrastructureError::EmptyDataset);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out() {
        let executor = TrialExecutor::new(
            |_: Configuration, input: Value| async move {
                if input == json!("slow") {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                Ok::<_, String>(input)
            },
            ExactMatch,
        )
        .with_config(ExecutorConfig::default().with_call_timeout(Duration::from_secs(1)));

        let record = executor
            .run(1, &config(), &labelled(&[("slow", "slow"), ("fast", "fast")]))
            .await
            .unwrap();

        assert_eq!(record.metric("accuracy"), Some(1.0));
        assert_eq!(
            record.failures[0].error,
            TrialExecutionError::Timeout { timeout_ms: 1000 }
        );
    }

    #[tokio::test]
    async fn panicking_callable_is_recorded() {
        let executor = TrialExecutor::new(
            |_: Configuration, input: Value| async move {
                if input == json!("boom") {
                    panic!("model exploded");
                }
                Ok::<_, String>(input)
            },
            ExactMatch,
        );
        let record = executor
            .run(1, &config(), &labelled(&[("boom", "boom"), ("ok", "ok")]))
            .await
            .unwrap();

        assert_eq!(record.status, TrialStatus::Succeeded);
        assert_eq!(
            record.failures[0].error,
            TrialExecutionError::Panicked("model exploded".to_string())
        );
    }

    #[tokio::test]
    async fn evaluator_errors_are_recorded() {
        let executor = TrialExecutor::new(
            |_: Configuration, input: Value| async move { Ok::<_, String>(input) },
            |output: &Value, _: &Value| -> Result<Metrics, String> {
                match output.as_str() {
                    Some("unparseable") => Err("cannot parse label".to_string()),
                    _ => Ok(Metrics::from([("accuracy".to_string(), 1.0)])),
                }
            },
        );
        let record = executor
            .run(1, &config(), &labelled(&[("unparseable", "x"), ("fine", "x")]))
            .await
            .unwrap();

        assert_eq!(
            record.failures[0].error,
            TrialExecutionError::Evaluator("cannot parse label".to_string())
        );
        assert_eq!(record.metric("accuracy"), Some(1.0));
    }

    #[tokio::test]
    async fn non_finite_metrics_are_evaluator_errors() {
        let executor = TrialExecutor::new(
            |_: Configuration, input: Value| async move { Ok::<_, String>(input) },
            |output: &Value, _: &Value| -> Result<Metrics, String> {
                let accuracy = match output.as_str() {
                    Some("nan") => f64::NAN,
                    Some("inf") => f64::INFINITY,
                    _ => 0.5,
                };
                Ok(Metrics::from([("accuracy".to_string(), accuracy)]))
            },
        );
        let record = executor
            .run(1, &config(), &labelled(&[("nan", "x"), ("inf", "x"), ("ok", "x")]))
            .await
            .unwrap();

        assert_eq!(record.status, TrialStatus::Succeeded);
        assert_eq!(record.metric("accuracy"), Some(0.5));
        assert_eq!(record.failures.len(), 2);
        assert!(matches!(
            &record.failures[0].error,
            TrialExecutionError::Evaluator(msg) if msg.contains("accuracy")
        ));

        let executor = TrialExecutor::new(
            |_: Configuration, input: Value| async move { Ok::<_, String>(input) },
            |_: &Value, _: &Value| -> Result<Metrics, String> {
                Ok(Metrics::from([("accuracy".to_string(), f64::NAN)]))
            },
        );
        let record = executor
            .run(1, &config(), &labelled(&[("a", "a")]))
            .await
            .unwrap();
        assert_eq!(record.status, TrialStatus::Failed);
        assert!(record.metrics.is_none());
    }

    #[tokio::test]
    async fn latency_is_filled_unless_reported() {
        let record = echo_executor()
            .run(1, &config(), &labelled(&[("a", "a")]))
            .await
            .unwrap();
        assert!(record.metric(LATENCY_METRIC).unwrap() >= 0.0);

        let executor = TrialExecutor::new(
            |_: Configuration, input: Value| async move { Ok::<_, String>(input) },
            |_: &Value, _: &Value| -> Result<Metrics, String> {
                Ok(Metrics::from([(LATENCY_METRIC.to_string(), 42.0)]))
            },
        );
        let record = executor
            .run(1, &config(), &labelled(&[("a", "a")]))
            .await
            .unwrap();
        assert_eq!(record.metric(LATENCY_METRIC), Some(42.0));
    }

    struct FirstPosition;

    impl Aggregator for FirstPosition {
        fn aggregate(&self, per_example: &[Metrics]) -> Metrics {
            Metrics::from([("first".to_string(), per_example[0]["position"])])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_examples_keep_dataset_order() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (in_flight_c, peak_c) = (Arc::clone(&in_flight), Arc::clone(&peak));

        let executor = TrialExecutor::new(
            move |_: Configuration, input: Value| {
                let in_flight = Arc::clone(&in_flight_c);
                let peak = Arc::clone(&peak_c);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    // Earlier examples take longer so they finish last.
                    let position = input.as_u64().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(100 - position * 10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(input)
                }
            },
            |output: &Value, _: &Value| -> Result<Metrics, String> {
                let position = output.as_f64().ok_or("not a number")?;
                Ok(Metrics::from([("position".to_string(), position)]))
            },
        )
        .with_aggregator(FirstPosition)
        .with_config(ExecutorConfig::default().with_max_concurrency(3));

        let dataset: Dataset = (0..8).map(|i| Example::new(i, i)).collect();
        let record = executor.run(1, &config(), &dataset).await.unwrap();

        assert_eq!(record.metric("first"), Some(0.0));
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn mean_aggregator_skips_missing_metrics() {
        let per_example = vec![
            Metrics::from([("accuracy".to_string(), 1.0), ("cost".to_string(), 0.2)]),
            Metrics::from([("accuracy".to_string(), 0.0)]),
        ];
        let mean = MeanAggregator.aggregate(&per_example);
        assert_eq!(mean["accuracy"], 0.5);
        assert_eq!(mean["cost"], 0.2);
    }

    #[test]
    fn executor_config_defaults() {
        let config: ExecutorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.call_timeout(), Duration::from_secs(60));
    }
}
