//! Tune a mock support-ticket classifier end to end.
//!
//! Usage: `pt-quickstart [settings.json]`. Set `PT_REMOTE_URL` and
//! `PT_API_KEY` to mirror the session to a coordination service; otherwise an
//! in-memory recorder stands in for it.

mod mock;

use anyhow::Context;
use pt_optimizer::{
    estimate_calls, optimize, CancellationHandle, LoggingCallback, OptimizationSettings,
    OptimizeRequest, StatisticsCallback, TrialExecutor,
};
use pt_remote::{HttpRemoteBackend, InMemoryBackend, RemoteBackend, RemoteConfig, RemoteCredentials};
use pt_types::{ConfigurationSpace, MaxTrials, Objective, ObjectiveSet};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn build_space() -> anyhow::Result<ConfigurationSpace> {
    let space = ConfigurationSpace::builder()
        .categorical("model", mock::MODELS)
        .float_steps("temperature", 0.0, 1.0, 3)
        .build()?;
    Ok(space)
}

fn default_settings() -> anyhow::Result<OptimizationSettings> {
    let objectives = ObjectiveSet::new(vec![Objective::accuracy(), Objective::cost()])?;
    Ok(OptimizationSettings::default()
        .with_objectives(objectives)
        .with_max_trials(MaxTrials::limited(10)?))
}

fn load_settings(path: Option<String>) -> anyhow::Result<OptimizationSettings> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading settings from {path}"))?;
            let settings = OptimizationSettings::from_json(&raw)
                .with_context(|| format!("parsing settings in {path}"))?;
            Ok(settings)
        }
        None => default_settings(),
    }
}

fn remote_backend() -> Arc<dyn RemoteBackend> {
    match (std::env::var("PT_REMOTE_URL"), std::env::var("PT_API_KEY")) {
        (Ok(url), Ok(key)) => {
            info!(url = %url, "mirroring to remote service");
            Arc::new(HttpRemoteBackend::new(
                RemoteConfig::new(url),
                RemoteCredentials::new(key),
            ))
        }
        _ => Arc::new(InMemoryBackend::new()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings(std::env::args().nth(1))?;
    let space = build_space()?;
    let dataset = mock::tickets();
    info!(
        space_size = space.size(),
        examples = dataset.len(),
        max_calls = estimate_calls(&space, settings.max_trials, dataset.len()),
        "starting optimization"
    );

    let cancellation = CancellationHandle::new();
    let on_interrupt = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current trial");
            on_interrupt.cancel();
        }
    });

    let stats = StatisticsCallback::new();
    let request = OptimizeRequest::new(
        space,
        dataset,
        TrialExecutor::new(mock::classify, mock::score),
    )
    .with_settings(settings)
    .with_callback(LoggingCallback)
    .with_callback(stats.clone())
    .with_remote(remote_backend())
    .with_cancellation(cancellation);

    let session = optimize(request).await?;

    let snapshot = stats.snapshot();
    info!(
        success_rate = snapshot.success_rate(),
        mean_trial_ms = snapshot.mean_duration().as_millis() as u64,
        "trial statistics"
    );
    println!("{}", serde_json::to_string_pretty(&session.summary())?);
    Ok(())
}
