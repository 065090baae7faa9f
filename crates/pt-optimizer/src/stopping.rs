//! Early-stopping policies evaluated after every appended trial.

use pt_types::{SessionState, TrialStatus};
use serde::{Deserialize, Serialize};

/// Decides whether a running session should stop before its budget is spent.
pub trait EarlyStoppingPolicy: Send {
    /// Inspect the session after an append; `Some(message)` stops it.
    fn should_stop(&mut self, session: &SessionState) -> Option<String>;

    fn name(&self) -> &str;
}

/// Never stops.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverStop;

impl EarlyStoppingPolicy for NeverStop {
    fn should_stop(&mut self, _session: &SessionState) -> Option<String> {
        None
    }

    fn name(&self) -> &str {
        "never"
    }
}

/// Stops after `patience` consecutive completed trials fail to improve the
/// primary objective by more than `min_delta`.
///
/// Failed trials count as "no improvement"; skipped ones are ignored.
#[derive(Debug, Clone)]
pub struct Patience {
    patience: u64,
    min_delta: f64,
    best: Option<f64>,
    stale: u64,
    seen: usize,
}

impl Patience {
    pub fn new(patience: u64, min_delta: f64) -> Self {
        Self {
            patience: patience.max(1),
            min_delta: min_delta.abs(),
            best: None,
            stale: 0,
            seen: 0,
        }
    }
}

impl EarlyStoppingPolicy for Patience {
    fn should_stop(&mut self, session: &SessionState) -> Option<String> {
        let objective = session.objectives().primary();
        for trial in session.trials().iter().skip(self.seen) {
            if !trial.is_completed() {
                continue;
            }
            let value = match trial.status {
                TrialStatus::Succeeded => trial.metric(&objective.name),
                _ => None,
            };
            let improved = match (value, self.best) {
                (Some(v), None) => {
                    self.best = Some(v);
                    true
                }
                (Some(v), Some(best)) => {
                    let gain = objective.oriented(v) - objective.oriented(best);
                    if gain > self.min_delta {
                        self.best = Some(v);
                        true
                    } else {
                        false
                    }
                }
                (None, _) => false,
            };
            if improved {
                self.stale = 0;
            } else {
                self.stale += 1;
            }
        }
        self.seen = session.trials().len();

        if self.stale >= self.patience {
            let best = self
                .best
                .map_or_else(|| "none".to_string(), |b| b.to_string());
            Some(format!(
                "no improvement in {} over {} trials (best {})",
                objective.name, self.stale, best
            ))
        } else {
            None
        }
    }

    fn name(&self) -> &str {
        "patience"
    }
}

/// Stops as soon as the best primary score reaches `target`.
#[derive(Debug, Clone, Copy)]
pub struct TargetScore {
    target: f64,
}

impl TargetScore {
    pub fn new(target: f64) -> Self {
        Self { target }
    }
}

impl EarlyStoppingPolicy for TargetScore {
    fn should_stop(&mut self, session: &SessionState) -> Option<String> {
        let objective = session.objectives().primary();
        let best = session.best_value(&objective.name)?;
        (objective.oriented(best) >= objective.oriented(self.target)).then(|| {
            format!(
                "{} reached target {} (best {})",
                objective.name, self.target, best
            )
        })
    }

    fn name(&self) -> &str {
        "target_score"
    }
}

/// Serializable policy selection for settings files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum EarlyStopping {
    Never,
    Patience {
        patience: u64,
        #[serde(default)]
        min_delta: f64,
    },
    TargetScore {
        target: f64,
    },
}

impl Default for EarlyStopping {
    fn default() -> Self {
        Self::Never
    }
}

impl EarlyStopping {
    pub fn into_policy(self) -> Box<dyn EarlyStoppingPolicy> {
        match self {
            Self::Never => Box::new(NeverStop),
            Self::Patience {
                patience,
                min_delta,
            } => Box::new(Patience::new(patience, min_delta)),
            Self::TargetScore { target } => Box::new(TargetScore::new(target)),
        }
    }
}
