//! Per-trial records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::TrialExecutionError;
use crate::objective::Metrics;
use crate::space::Configuration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Succeeded,
    Failed,
    /// Issued but never executed; does not count toward `completed_count`.
    Skipped,
}

/// A single dataset example that could not be scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleFailure {
    /// Position of the example in the dataset.
    pub index: usize,
    pub error: TrialExecutionError,
}

/// Outcome of one configuration evaluated against the dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    /// 1-based issuance ordinal.
    pub ordinal: u64,
    pub configuration: Configuration,
    pub status: TrialStatus,
    /// Aggregated scores. `None` when no example could be scored.
    pub metrics: Option<Metrics>,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    pub examples_total: usize,
    pub failures: Vec<ExampleFailure>,
}

impl TrialRecord {
    pub fn skipped(ordinal: u64, configuration: Configuration) -> Self {
        Self {
            ordinal,
            configuration,
            status: TrialStatus::Skipped,
            metrics: None,
            duration: Duration::ZERO,
            started_at: Utc::now(),
            examples_total: 0,
            failures: Vec::new(),
        }
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.as_ref().and_then(|m| m.get(name).copied())
    }

    pub fn examples_succeeded(&self) -> usize {
        self.examples_total.saturating_sub(self.failures.len())
    }

    /// Succeeded or failed, i.e. actually executed.
    pub fn is_completed(&self) -> bool {
        matches!(self.status, TrialStatus::Succeeded | TrialStatus::Failed)
    }
}
