//! Parameter declarations, the configuration space and its deterministic
//! enumeration.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::errors::ConfigurationError;

/// A concrete candidate value for one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ParameterValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// How a parameter's candidates are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Categorical,
    Continuous,
    Discrete,
    Boolean,
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Categorical => "categorical",
            Self::Continuous => "continuous",
            Self::Discrete => "discrete",
            Self::Boolean => "boolean",
        };
        f.write_str(s)
    }
}

/// One declared parameter: a name, its kind and its ordered candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawParameterSpec")]
pub struct ParameterSpec {
    name: String,
    kind: ParameterKind,
    values: Vec<ParameterValue>,
}

#[derive(Deserialize)]
struct RawParameterSpec {
    name: String,
    kind: ParameterKind,
    values: Vec<ParameterValue>,
}

impl TryFrom<RawParameterSpec> for ParameterSpec {
    type Error = ConfigurationError;

    fn try_from(raw: RawParameterSpec) -> Result<Self, Self::Error> {
        ParameterSpec::new(raw.name, raw.kind, raw.values)
    }
}

impl ParameterSpec {
    /// Validate and build a parameter. Continuous candidates given as integers
    /// are widened to floats.
    pub fn new(
        name: impl Into<String>,
        kind: ParameterKind,
        values: Vec<ParameterValue>,
    ) -> Result<Self, ConfigurationError> {
        let name = name.into();
        if values.is_empty() {
            return Err(ConfigurationError::NoCandidates { name });
        }

        let mut checked: Vec<ParameterValue> = Vec::with_capacity(values.len());
        for value in values {
            let value = coerce(&name, kind, value)?;
            if checked.contains(&value) {
                return Err(ConfigurationError::DuplicateCandidate {
                    name,
                    value: value.to_string(),
                });
            }
            checked.push(value);
        }

        Ok(Self {
            name,
            kind,
            values: checked,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ParameterKind {
        self.kind
    }

    pub fn values(&self) -> &[ParameterValue] {
        &self.values
    }

    pub fn cardinality(&self) -> usize {
        self.values.len()
    }
}

fn coerce(
    name: &str,
    kind: ParameterKind,
    value: ParameterValue,
) -> Result<ParameterValue, ConfigurationError> {
    let coerced = match (kind, value) {
        (ParameterKind::Boolean, v @ ParameterValue::Bool(_)) => v,
        (ParameterKind::Discrete, v @ ParameterValue::Int(_)) => v,
        (ParameterKind::Continuous, ParameterValue::Int(i)) => ParameterValue::Float(i as f64),
        (ParameterKind::Continuous, v @ ParameterValue::Float(_)) => v,
        (ParameterKind::Categorical, v) => v,
        (kind, value) => {
            return Err(ConfigurationError::KindMismatch {
                name: name.to_string(),
                kind: kind.to_string(),
                value: value.to_string(),
            })
        }
    };

    if let ParameterValue::Float(f) = coerced {
        if !f.is_finite() {
            return Err(ConfigurationError::KindMismatch {
                name: name.to_string(),
                kind: kind.to_string(),
                value: f.to_string(),
            });
        }
    }
    Ok(coerced)
}

/// The full configuration space, sorted by parameter name.
///
/// Only reachable through [`SpaceBuilder::build`], [`ConfigurationSpace::from_specs`]
/// or deserialization, all of which validate, so every value of this type has
/// at least one parameter, every parameter has at least one candidate, and the
/// product size fits in a `u64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ParameterSpec>", into = "Vec<ParameterSpec>")]
pub struct ConfigurationSpace {
    parameters: Vec<ParameterSpec>,
    size: u64,
}

impl ConfigurationSpace {
    pub fn builder() -> SpaceBuilder {
        SpaceBuilder::default()
    }

    pub fn from_specs(mut specs: Vec<ParameterSpec>) -> Result<Self, ConfigurationError> {
        if specs.is_empty() {
            return Err(ConfigurationError::EmptySpace);
        }

        let mut seen = HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.name.clone()) {
                return Err(ConfigurationError::DuplicateParameter {
                    name: spec.name.clone(),
                });
            }
        }

        specs.sort_by(|a, b| a.name.cmp(&b.name));

        let mut size: u64 = 1;
        for spec in &specs {
            if spec.values.is_empty() {
                return Err(ConfigurationError::NoCandidates {
                    name: spec.name.clone(),
                });
            }
            size = size
                .checked_mul(spec.values.len() as u64)
                .ok_or(ConfigurationError::SpaceTooLarge)?;
        }

        Ok(Self {
            parameters: specs,
            size,
        })
    }

    /// Exact number of points in the Cartesian product.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters
            .binary_search_by(|p| p.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.parameters[i])
    }

    /// Lazy, restartable walk over every configuration in enumeration order.
    pub fn enumerate(&self) -> SpaceIter<'_> {
        SpaceIter {
            space: self,
            next: 0,
        }
    }

    /// Decode an enumeration index into its configuration. The first parameter
    /// (by name) is the most significant digit.
    pub fn configuration_at(&self, index: u64) -> Option<Configuration> {
        if index >= self.size {
            return None;
        }

        let mut rem = index;
        let mut values = BTreeMap::new();
        for spec in self.parameters.iter().rev() {
            let radix = spec.values.len() as u64;
            let digit = (rem % radix) as usize;
            rem /= radix;
            values.insert(spec.name.clone(), spec.values[digit].clone());
        }

        Some(Configuration { index, values })
    }

    /// Candidate position of each parameter (in name order) for an index,
    /// without cloning any values.
    pub fn candidate_indices(&self, index: u64) -> Option<Vec<usize>> {
        if index >= self.size {
            return None;
        }

        let mut rem = index;
        let mut digits = vec![0; self.parameters.len()];
        for (slot, spec) in digits.iter_mut().zip(&self.parameters).rev() {
            let radix = spec.values.len() as u64;
            *slot = (rem % radix) as usize;
            rem /= radix;
        }
        Some(digits)
    }
}

impl TryFrom<Vec<ParameterSpec>> for ConfigurationSpace {
    type Error = ConfigurationError;

    fn try_from(specs: Vec<ParameterSpec>) -> Result<Self, Self::Error> {
        Self::from_specs(specs)
    }
}

impl From<ConfigurationSpace> for Vec<ParameterSpec> {
    fn from(space: ConfigurationSpace) -> Self {
        space.parameters
    }
}

/// Chained builder for a [`ConfigurationSpace`]. Validation happens in
/// [`SpaceBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct SpaceBuilder {
    pending: Vec<(String, ParameterKind, Vec<ParameterValue>)>,
}

impl SpaceBuilder {
    fn push(
        mut self,
        name: impl Into<String>,
        kind: ParameterKind,
        values: Vec<ParameterValue>,
    ) -> Self {
        self.pending.push((name.into(), kind, values));
        self
    }

    pub fn categorical<V, I>(self, name: impl Into<String>, values: I) -> Self
    where
        V: Into<ParameterValue>,
        I: IntoIterator<Item = V>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.push(name, ParameterKind::Categorical, values)
    }

    pub fn continuous<I>(self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let values = values.into_iter().map(ParameterValue::Float).collect();
        self.push(name, ParameterKind::Continuous, values)
    }

    pub fn discrete<I>(self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = i64>,
    {
        let values = values.into_iter().map(ParameterValue::Int).collect();
        self.push(name, ParameterKind::Discrete, values)
    }

    pub fn boolean(self, name: impl Into<String>) -> Self {
        let values = vec![ParameterValue::Bool(false), ParameterValue::Bool(true)];
        self.push(name, ParameterKind::Boolean, values)
    }

    /// Inclusive integer range; `low > high` yields no candidates.
    pub fn int_range(self, name: impl Into<String>, low: i64, high: i64) -> Self {
        let values = (low..=high).map(ParameterValue::Int).collect();
        self.push(name, ParameterKind::Discrete, values)
    }

    /// `steps` evenly spaced points over `[low, high]` (at least two).
    pub fn float_steps(self, name: impl Into<String>, low: f64, high: f64, steps: usize) -> Self {
        let steps = steps.max(2);
        let values = (0..steps)
            .map(|i| {
                let t = i as f64 / (steps - 1) as f64;
                ParameterValue::Float(low + t * (high - low))
            })
            .collect();
        self.push(name, ParameterKind::Continuous, values)
    }

    /// `steps` points evenly spaced in log-space over `[low, high]`.
    pub fn log_steps(self, name: impl Into<String>, low: f64, high: f64, steps: usize) -> Self {
        let steps = steps.max(2);
        let log_low = low.ln();
        let log_high = high.ln();
        let values = (0..steps)
            .map(|i| {
                let t = i as f64 / (steps - 1) as f64;
                ParameterValue::Float((log_low + t * (log_high - log_low)).exp())
            })
            .collect();
        self.push(name, ParameterKind::Continuous, values)
    }

    pub fn parameter(self, spec: ParameterSpec) -> Self {
        self.push(spec.name, spec.kind, spec.values)
    }

    pub fn build(self) -> Result<ConfigurationSpace, ConfigurationError> {
        let specs = self
            .pending
            .into_iter()
            .map(|(name, kind, values)| ParameterSpec::new(name, kind, values))
            .collect::<Result<Vec<_>, _>>()?;
        ConfigurationSpace::from_specs(specs)
    }
}

/// One point of the configuration space.
///
/// Equality compares parameter values only; the enumeration index is carried
/// along so strategies can track issuance cheaply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    index: u64,
    values: BTreeMap<String, ParameterValue>,
}

impl Configuration {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    pub fn values(&self) -> &BTreeMap<String, ParameterValue> {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl PartialEq for Configuration {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.values {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
            first = false;
        }
        Ok(())
    }
}

/// Iterator returned by [`ConfigurationSpace::enumerate`].
#[derive(Debug, Clone)]
pub struct SpaceIter<'a> {
    space: &'a ConfigurationSpace,
    next: u64,
}

impl Iterator for SpaceIter<'_> {
    type Item = Configuration;

    fn next(&mut self) -> Option<Self::Item> {
        let config = self.space.configuration_at(self.next)?;
        self.next += 1;
        Some(config)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.space.size - self.next;
        match usize::try_from(remaining) {
            Ok(n) => (n, Some(n)),
            Err(_) => (usize::MAX, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn llm_space() -> ConfigurationSpace {
        ConfigurationSpace::builder()
            .categorical("model", ["A", "B"])
            .continuous("temperature", [0.0, 0.5])
            .build()
            .unwrap()
    }

    #[test]
    fn size_is_product_of_cardinalities() {
        let space = ConfigurationSpace::builder()
            .categorical("model", ["gpt-3.5-turbo", "gpt-4o-mini", "claude"])
            .float_steps("temperature", 0.0, 1.0, 5)
            .boolean("use_cot")
            .build()
            .unwrap();
        assert_eq!(space.size(), 30);
        assert_eq!(space.enumerate().count(), 30);
    }

    #[test]
    fn empty_candidates_rejected() {
        let err = ConfigurationSpace::builder()
            .categorical("model", ["A"])
            .continuous("temperature", Vec::<f64>::new())
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::NoCandidates {
                name: "temperature".into()
            }
        );

        let err = ConfigurationSpace::builder().int_range("k", 5, 1).build().unwrap_err();
        assert!(matches!(err, ConfigurationError::NoCandidates { .. }));
    }

    #[test]
    fn empty_space_rejected() {
        assert_eq!(
            ConfigurationSpace::builder().build().unwrap_err(),
            ConfigurationError::EmptySpace
        );
    }

    #[test]
    fn duplicate_names_and_values_rejected() {
        let err = ConfigurationSpace::builder()
            .categorical("model", ["A"])
            .categorical("model", ["B"])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateParameter { .. }));

        let err = ConfigurationSpace::builder()
            .categorical("model", ["A", "A"])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateCandidate { .. }));
    }

    #[test]
    fn kind_mismatch_rejected() {
        let err = ParameterSpec::new(
            "top_k",
            ParameterKind::Discrete,
            vec![ParameterValue::Float(0.5)],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::KindMismatch { .. }));

        let err = ParameterSpec::new(
            "temperature",
            ParameterKind::Continuous,
            vec![ParameterValue::Float(f64::NAN)],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::KindMismatch { .. }));
    }

    #[test]
    fn continuous_widens_integers() {
        let spec = ParameterSpec::new(
            "temperature",
            ParameterKind::Continuous,
            vec![ParameterValue::Int(0), ParameterValue::Int(1)],
        )
        .unwrap();
        assert_eq!(spec.values()[1], ParameterValue::Float(1.0));
    }

    #[test]
    fn overflow_is_a_configuration_error() {
        let mut builder = ConfigurationSpace::builder();
        for i in 0..20 {
            builder = builder.int_range(format!("p{i:02}"), 0, 99);
        }
        assert_eq!(builder.build().unwrap_err(), ConfigurationError::SpaceTooLarge);
    }

    #[test]
    fn enumeration_is_lexicographic_by_sorted_name() {
        // Declared out of order on purpose: "model" sorts before "temperature".
        let space = ConfigurationSpace::builder()
            .continuous("temperature", [0.0, 0.5])
            .categorical("model", ["A", "B"])
            .build()
            .unwrap();

        let order: Vec<String> = space.enumerate().map(|c| c.to_string()).collect();
        assert_eq!(
            order,
            vec![
                "model=A, temperature=0",
                "model=A, temperature=0.5",
                "model=B, temperature=0",
                "model=B, temperature=0.5",
            ]
        );
    }

    #[test]
    fn enumeration_is_restartable_and_indexed() {
        let space = llm_space();
        let first: Vec<Configuration> = space.enumerate().collect();
        let second: Vec<Configuration> = space.enumerate().collect();
        assert_eq!(first, second);

        for (i, config) in first.iter().enumerate() {
            assert_eq!(config.index(), i as u64);
            assert_eq!(space.configuration_at(i as u64).as_ref(), Some(config));
        }
        assert!(space.configuration_at(4).is_none());
        assert_eq!(space.candidate_indices(2), Some(vec![1, 0]));
        assert_eq!(space.candidate_indices(4), None);
    }

    #[test]
    fn configuration_equality_is_by_value() {
        let space = llm_space();
        let a = space.configuration_at(1).unwrap();
        let b = space.configuration_at(1).unwrap();
        let c = space.configuration_at(2).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.get("model"), Some(&ParameterValue::from("A")));
        assert_eq!(a.get("temperature").and_then(ParameterValue::as_f64), Some(0.5));
    }

    #[test]
    fn deserialization_validates() {
        let json = serde_json::json!([
            {"name": "model", "kind": "categorical", "values": ["A", "B"]},
            {"name": "temperature", "kind": "continuous", "values": [0, 0.5]}
        ]);
        let space: ConfigurationSpace = serde_json::from_value(json).unwrap();
        assert_eq!(space.size(), 4);
        assert_eq!(space, llm_space());

        let bad = serde_json::json!([
            {"name": "model", "kind": "categorical", "values": []}
        ]);
        assert!(serde_json::from_value::<ConfigurationSpace>(bad).is_err());
    }

    #[test]
    fn log_steps_cover_bounds() {
        let space = ConfigurationSpace::builder()
            .log_steps("top_p", 0.01, 1.0, 3)
            .build()
            .unwrap();
        let values = space.parameter("top_p").unwrap().values();
        assert_eq!(values.len(), 3);
        let first = values[0].as_f64().unwrap();
        let last = values[2].as_f64().unwrap();
        assert!((first - 0.01).abs() < 1e-12);
        assert!((last - 1.0).abs() < 1e-12);
    }
}
