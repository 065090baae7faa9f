//! Search strategies: which configuration to try next.

use pt_types::{Configuration, ConfigurationSpace, Metrics, Objective, TrialRecord};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Answer of [`SearchStrategy::suggest`].
#[derive(Debug, Clone, PartialEq)]
pub enum Suggestion {
    Next(Configuration),
    Exhausted,
}

/// Common trait for all search strategies.
pub trait SearchStrategy: Send {
    /// Produce the next configuration to evaluate, or `Exhausted`.
    fn suggest(&mut self, history: &[TrialRecord]) -> Suggestion;

    /// Report a finished trial so adaptive strategies can learn. `metrics` is
    /// `None` for failed trials.
    fn report(&mut self, _configuration: &Configuration, _metrics: Option<&Metrics>) {}

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

/// Selectable strategy family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Grid,
    Random,
    #[serde(alias = "bayesian")]
    Guided,
}

impl Default for StrategyKind {
    fn default() -> Self {
        Self::Grid
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Grid => "grid",
            Self::Random => "random",
            Self::Guided => "guided",
        };
        f.write_str(s)
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "grid" => Ok(Self::Grid),
            "random" => Ok(Self::Random),
            "guided" | "bayesian" => Ok(Self::Guided),
            other => Err(format!("unknown search strategy '{other}'")),
        }
    }
}

impl StrategyKind {
    /// Instantiate the strategy. `issue_limit` caps Random issuance; Grid and
    /// Guided walk the whole space and rely on the orchestrator's cap.
    pub fn build(
        self,
        space: Arc<ConfigurationSpace>,
        objective: Objective,
        seed: Option<u64>,
        issue_limit: Option<u64>,
        guided: GuidedConfig,
    ) -> Box<dyn SearchStrategy> {
        match self {
            Self::Grid => Box::new(GridSearch::new(space)),
            Self::Random => {
                let mut random = RandomSearch::new(space, seed);
                if let Some(limit) = issue_limit {
                    random = random.with_limit(limit);
                }
                Box::new(random)
            }
            Self::Guided => Box::new(GuidedSearch::new(space, objective, guided, seed)),
        }
    }
}

fn seeded_rng(seed: Option<u64>) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed.unwrap_or_else(rand::random))
}

/// Sparse Fisher-Yates over `0..n`: yields every index exactly once in random
/// order while only storing the displaced slots.
#[derive(Debug, Clone)]
struct IndexShuffle {
    n: u64,
    drawn: u64,
    displaced: HashMap<u64, u64>,
}

impl IndexShuffle {
    fn new(n: u64) -> Self {
        Self {
            n,
            drawn: 0,
            displaced: HashMap::new(),
        }
    }

    fn draw(&mut self, rng: &mut ChaCha8Rng) -> Option<u64> {
        if self.drawn >= self.n {
            return None;
        }
        let head = self.drawn;
        let pick = rng.gen_range(head..self.n);
        let picked = self.displaced.get(&pick).copied().unwrap_or(pick);
        let head_value = self.displaced.remove(&head).unwrap_or(head);
        if pick != head {
            self.displaced.insert(pick, head_value);
        }
        self.drawn += 1;
        Some(picked)
    }
}

// ---- Grid search ----

/// Exhaustive walk of the space in enumeration order.
#[derive(Debug, Clone)]
pub struct GridSearch {
    space: Arc<ConfigurationSpace>,
    cursor: u64,
}

impl GridSearch {
    pub fn new(space: Arc<ConfigurationSpace>) -> Self {
        Self { space, cursor: 0 }
    }
}

impl SearchStrategy for GridSearch {
    fn suggest(&mut self, _history: &[TrialRecord]) -> Suggestion {
        match self.space.configuration_at(self.cursor) {
            Some(config) => {
                self.cursor += 1;
                Suggestion::Next(config)
            }
            None => Suggestion::Exhausted,
        }
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Random search ----

/// Uniform sampling without replacement.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: Arc<ConfigurationSpace>,
    rng: ChaCha8Rng,
    shuffle: IndexShuffle,
    limit: Option<u64>,
    issued: u64,
}

impl RandomSearch {
    pub fn new(space: Arc<ConfigurationSpace>, seed: Option<u64>) -> Self {
        let shuffle = IndexShuffle::new(space.size());
        Self {
            space,
            rng: seeded_rng(seed),
            shuffle,
            limit: None,
            issued: 0,
        }
    }

    /// Stop after `limit` configurations even if the space is larger.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl SearchStrategy for RandomSearch {
    fn suggest(&mut self, _history: &[TrialRecord]) -> Suggestion {
        if self.limit.is_some_and(|limit| self.issued >= limit) {
            return Suggestion::Exhausted;
        }
        let Some(index) = self.shuffle.draw(&mut self.rng) else {
            return Suggestion::Exhausted;
        };
        match self.space.configuration_at(index) {
            Some(config) => {
                self.issued += 1;
                Suggestion::Next(config)
            }
            None => Suggestion::Exhausted,
        }
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Guided search ----

/// Tuning for [`GuidedSearch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuidedConfig {
    /// Observations required before the model is trusted; until then
    /// suggestions are uniform random.
    pub warmup_trials: usize,
    /// Weight of the upper-confidence bonus, relative to the observed spread.
    pub exploration: f64,
    /// When set, stop once no unissued configuration's optimistic score beats
    /// the best observation by at least this margin (objective units).
    pub confidence_margin: Option<f64>,
    /// Spaces larger than this are scored on a random sample of candidates.
    pub scan_limit: u64,
}

impl Default for GuidedConfig {
    fn default() -> Self {
        Self {
            warmup_trials: 3,
            exploration: 1.0,
            confidence_margin: None,
            scan_limit: 50_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CandidateStats {
    count: u64,
    sum: f64,
}

/// Additive upper-confidence model over discrete candidates.
///
/// Each candidate value of each parameter keeps the mean of the primary
/// objective (oriented so that higher is better) over the trials that used
/// it. A configuration's score is the average over its parameters of
/// `mean + exploration * spread * sqrt(ln(n + 1) / (count + 1))`, where unseen
/// values fall back to the global mean. The best-scoring unissued point wins,
/// lowest enumeration index first on ties.
#[derive(Debug, Clone)]
pub struct GuidedSearch {
    space: Arc<ConfigurationSpace>,
    objective: Objective,
    config: GuidedConfig,
    rng: ChaCha8Rng,
    shuffle: IndexShuffle,
    issued: HashSet<u64>,
    stats: Vec<Vec<CandidateStats>>,
    observations: u64,
    total: f64,
    best: Option<f64>,
    worst: Option<f64>,
    stopped: bool,
}

impl GuidedSearch {
    pub fn new(
        space: Arc<ConfigurationSpace>,
        objective: Objective,
        config: GuidedConfig,
        seed: Option<u64>,
    ) -> Self {
        let stats = space
            .parameters()
            .iter()
            .map(|p| vec![CandidateStats::default(); p.cardinality()])
            .collect();
        let shuffle = IndexShuffle::new(space.size());
        Self {
            space,
            objective,
            config,
            rng: seeded_rng(seed),
            shuffle,
            issued: HashSet::new(),
            stats,
            observations: 0,
            total: 0.0,
            best: None,
            worst: None,
            stopped: false,
        }
    }

    pub fn observations(&self) -> u64 {
        self.observations
    }

    fn issue(&mut self, index: u64) -> Suggestion {
        match self.space.configuration_at(index) {
            Some(config) => {
                self.issued.insert(index);
                Suggestion::Next(config)
            }
            None => Suggestion::Exhausted,
        }
    }

    fn explore(&mut self) -> Suggestion {
        while let Some(index) = self.shuffle.draw(&mut self.rng) {
            if !self.issued.contains(&index) {
                return self.issue(index);
            }
        }
        Suggestion::Exhausted
    }

    fn score(&self, index: u64) -> f64 {
        let Some(digits) = self.space.candidate_indices(index) else {
            return f64::NEG_INFINITY;
        };
        let global_mean = self.total / self.observations.max(1) as f64;
        let spread = match (self.best, self.worst) {
            (Some(b), Some(w)) if b > w => b - w,
            _ => 1.0,
        };
        let log_n = ((self.observations + 1) as f64).ln();

        let sum: f64 = digits
            .iter()
            .zip(&self.stats)
            .map(|(&digit, param)| {
                let s = param[digit];
                let mean = if s.count > 0 {
                    s.sum / s.count as f64
                } else {
                    global_mean
                };
                let bonus =
                    self.config.exploration * spread * (log_n / (s.count + 1) as f64).sqrt();
                mean + bonus
            })
            .sum();
        sum / digits.len().max(1) as f64
    }

    /// Unissued candidates in ascending index order.
    fn candidates(&mut self) -> Vec<u64> {
        let size = self.space.size();
        if size <= self.config.scan_limit {
            return (0..size).filter(|i| !self.issued.contains(i)).collect();
        }
        let mut sample = BTreeSet::new();
        for _ in 0..self.config.scan_limit {
            let index = self.rng.gen_range(0..size);
            if !self.issued.contains(&index) {
                sample.insert(index);
            }
        }
        sample.into_iter().collect()
    }
}

impl SearchStrategy for GuidedSearch {
    fn suggest(&mut self, _history: &[TrialRecord]) -> Suggestion {
        if self.stopped || self.issued.len() as u64 >= self.space.size() {
            return Suggestion::Exhausted;
        }
        if self.observations < self.config.warmup_trials as u64 {
            return self.explore();
        }

        let mut chosen: Option<(u64, f64)> = None;
        for index in self.candidates() {
            let score = self.score(index);
            if chosen.map_or(true, |(_, best)| score > best) {
                chosen = Some((index, score));
            }
        }

        let Some((index, score)) = chosen else {
            return self.explore();
        };

        if let (Some(margin), Some(best)) = (self.config.confidence_margin, self.best) {
            if score < best + margin {
                debug!(
                    optimistic = score,
                    best,
                    margin,
                    "guided search confident no remaining configuration improves"
                );
                self.stopped = true;
                return Suggestion::Exhausted;
            }
        }

        self.issue(index)
    }

    fn report(&mut self, configuration: &Configuration, metrics: Option<&Metrics>) {
        let Some(value) = metrics.and_then(|m| m.get(&self.objective.name)).copied() else {
            return;
        };
        let Some(digits) = self.space.candidate_indices(configuration.index()) else {
            return;
        };
        let value = self.objective.oriented(value);

        for (digit, param) in digits.into_iter().zip(self.stats.iter_mut()) {
            param[digit].count += 1;
            param[digit].sum += value;
        }
        self.observations += 1;
        self.total += value;
        self.best = Some(self.best.map_or(value, |b| b.max(value)));
        self.worst = Some(self.worst.map_or(value, |w| w.min(value)));
    }

    fn name(&self) -> &str {
        "guided"
    }
}
