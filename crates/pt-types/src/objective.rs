//! Optimization objectives and per-trial metric maps.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::errors::ConfigurationError;

/// Objective name → score. Sorted so reports and wire payloads are stable.
pub type Metrics = BTreeMap<String, f64>;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Maximize
    }
}

/// A named score to optimize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Objective {
    pub name: String,
    #[serde(default)]
    pub direction: ObjectiveDirection,
}

impl Objective {
    pub fn new(name: impl Into<String>, direction: ObjectiveDirection) -> Self {
        Self {
            name: name.into(),
            direction,
        }
    }

    pub fn maximize(name: impl Into<String>) -> Self {
        Self::new(name, ObjectiveDirection::Maximize)
    }

    pub fn minimize(name: impl Into<String>) -> Self {
        Self::new(name, ObjectiveDirection::Minimize)
    }

    pub fn accuracy() -> Self {
        Self::maximize("accuracy")
    }

    /// Spend per trial, in whatever unit the evaluator reports.
    pub fn cost() -> Self {
        Self::minimize("cost")
    }

    /// Seconds per example.
    pub fn latency() -> Self {
        Self::minimize("latency")
    }

    /// Strict improvement of `candidate` over `incumbent`.
    pub fn is_better(&self, candidate: f64, incumbent: f64) -> bool {
        match self.direction {
            ObjectiveDirection::Maximize => candidate > incumbent,
            ObjectiveDirection::Minimize => candidate < incumbent,
        }
    }

    /// Map a raw score so that larger is always better.
    pub fn oriented(&self, value: f64) -> f64 {
        match self.direction {
            ObjectiveDirection::Maximize => value,
            ObjectiveDirection::Minimize => -value,
        }
    }
}

/// Non-empty, duplicate-free list of objectives. The first one is primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Objective>", into = "Vec<Objective>")]
pub struct ObjectiveSet {
    objectives: Vec<Objective>,
}

impl ObjectiveSet {
    pub fn new(objectives: Vec<Objective>) -> Result<Self, ConfigurationError> {
        if objectives.is_empty() {
            return Err(ConfigurationError::NoObjectives);
        }
        let mut seen = HashSet::new();
        for objective in &objectives {
            if !seen.insert(objective.name.as_str()) {
                return Err(ConfigurationError::DuplicateObjective {
                    name: objective.name.clone(),
                });
            }
        }
        Ok(Self { objectives })
    }

    pub fn single(objective: Objective) -> Self {
        Self {
            objectives: vec![objective],
        }
    }

    pub fn primary(&self) -> &Objective {
        &self.objectives[0]
    }

    pub fn get(&self, name: &str) -> Option<&Objective> {
        self.objectives.iter().find(|o| o.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Objective> {
        self.objectives.iter()
    }

    pub fn len(&self) -> usize {
        self.objectives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objectives.is_empty()
    }
}

impl Default for ObjectiveSet {
    fn default() -> Self {
        Self::single(Objective::accuracy())
    }
}

impl TryFrom<Vec<Objective>> for ObjectiveSet {
    type Error = ConfigurationError;

    fn try_from(objectives: Vec<Objective>) -> Result<Self, Self::Error> {
        Self::new(objectives)
    }
}

impl From<ObjectiveSet> for Vec<Objective> {
    fn from(set: ObjectiveSet) -> Self {
        set.objectives
    }
}

impl<'a> IntoIterator for &'a ObjectiveSet {
    type Item = &'a Objective;
    type IntoIter = std::slice::Iter<'a, Objective>;

    fn into_iter(self) -> Self::IntoIter {
        self.objectives.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_directions() {
        assert_eq!(Objective::accuracy().direction, ObjectiveDirection::Maximize);
        assert_eq!(Objective::cost().direction, ObjectiveDirection::Minimize);
        assert_eq!(Objective::latency().direction, ObjectiveDirection::Minimize);
    }

    #[test]
    fn is_better_respects_direction() {
        assert!(Objective::accuracy().is_better(0.9, 0.8));
        assert!(!Objective::accuracy().is_better(0.8, 0.8));
        assert!(Objective::cost().is_better(0.01, 0.02));
        assert_eq!(Objective::cost().oriented(2.0), -2.0);
    }

    #[test]
    fn objective_set_validation() {
        assert_eq!(
            ObjectiveSet::new(vec![]).unwrap_err(),
            ConfigurationError::NoObjectives
        );
        let err =
            ObjectiveSet::new(vec![Objective::accuracy(), Objective::accuracy()]).unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateObjective { .. }));

        let set = ObjectiveSet::new(vec![Objective::accuracy(), Objective::cost()]).unwrap();
        assert_eq!(set.primary().name, "accuracy");
        assert!(set.contains("cost"));
        assert!(!set.contains("latency"));
    }

    #[test]
    fn direction_defaults_to_maximize_when_omitted() {
        let raw = r#"[{"name": "accuracy"}, {"name": "cost", "direction": "minimize"}]"#;
        let set: ObjectiveSet = serde_json::from_str(raw).unwrap();
        assert_eq!(set.primary().direction, ObjectiveDirection::Maximize);
        assert_eq!(set.get("cost").unwrap().direction, ObjectiveDirection::Minimize);
    }
}
