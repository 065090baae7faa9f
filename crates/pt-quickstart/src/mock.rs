//! Offline stand-in for an LLM support-ticket classifier.
//!
//! Larger models recognise more keywords and cost more per token; higher
//! temperatures flip a deterministic share of answers.

use pt_optimizer::{Dataset, Example};
use pt_types::{Configuration, Metrics, ParameterValue};
use serde_json::{json, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

pub const MODELS: [&str; 3] = ["gpt-3.5-turbo", "gpt-4o-mini", "gpt-4o"];

const LABELS: [&str; 3] = ["technical", "billing", "general"];

const TECHNICAL: [&str; 6] = ["crash", "error", "bug", "login", "password", "slow"];
const BILLING: [&str; 6] = ["charge", "invoice", "refund", "payment", "subscription", "price"];

struct ModelProfile {
    /// How many entries of each keyword list the model knows.
    vocabulary: usize,
    dollars_per_1k_tokens: f64,
    latency: Duration,
}

fn profile(model: &str) -> Option<ModelProfile> {
    let (vocabulary, dollars_per_1k_tokens, latency_ms) = match model {
        "gpt-3.5-turbo" => (2, 0.0015, 5),
        "gpt-4o-mini" => (4, 0.0006, 8),
        "gpt-4o" => (6, 0.01, 15),
        _ => return None,
    };
    Some(ModelProfile {
        vocabulary,
        dollars_per_1k_tokens,
        latency: Duration::from_millis(latency_ms),
    })
}

/// Roughly one token per four characters.
fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        0
    } else {
        (text.len() / 4).max(1)
    }
}

/// Uniform-looking value in `[0, 1)` fixed by the inputs.
fn jitter(text: &str, model: &str, temperature: f64) -> f64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    model.hash(&mut hasher);
    temperature.to_bits().hash(&mut hasher);
    (hasher.finish() % 10_000) as f64 / 10_000.0
}

fn keyword_label(text: &str, vocabulary: usize) -> usize {
    let text = text.to_lowercase();
    let knows = |words: &[&str]| words.iter().take(vocabulary).any(|w| text.contains(w));
    if knows(&TECHNICAL) {
        0
    } else if knows(&BILLING) {
        1
    } else {
        2
    }
}

pub async fn classify(config: Configuration, input: Value) -> Result<Value, String> {
    let text = input.as_str().ok_or("ticket text must be a string")?;
    let model = config
        .get("model")
        .and_then(ParameterValue::as_str)
        .unwrap_or(MODELS[0]);
    let temperature = config
        .get("temperature")
        .and_then(ParameterValue::as_f64)
        .unwrap_or(0.0);
    let profile = profile(model).ok_or_else(|| format!("unknown model '{model}'"))?;

    tokio::time::sleep(profile.latency).await;

    let mut label = keyword_label(text, profile.vocabulary);
    if jitter(text, model, temperature) < temperature * 0.5 {
        label = (label + 1) % LABELS.len();
    }
    let tokens = estimate_tokens(text) + 1;
    Ok(json!({
        "label": LABELS[label],
        "cost": tokens as f64 * profile.dollars_per_1k_tokens / 1000.0,
    }))
}

pub fn score(output: &Value, expected: &Value) -> Result<Metrics, String> {
    let label = output
        .get("label")
        .and_then(Value::as_str)
        .ok_or("response has no label")?;
    let cost = output
        .get("cost")
        .and_then(Value::as_f64)
        .ok_or("response has no cost")?;
    let accuracy = if Some(label) == expected.as_str() { 1.0 } else { 0.0 };
    Ok(Metrics::from([
        ("accuracy".to_string(), accuracy),
        ("cost".to_string(), cost),
    ]))
}

pub fn tickets() -> Dataset {
    [
        ("My app keeps crashing when I open settings", "technical"),
        ("I see an error code 500 on the dashboard", "technical"),
        ("Found a bug in the export feature", "technical"),
        ("Cannot login since this morning", "technical"),
        ("Password reset email never arrives", "technical"),
        ("Pages are really slow to load today", "technical"),
        ("Why was I charged twice this month?", "billing"),
        ("Please resend my last invoice", "billing"),
        ("I would like a refund for the annual plan", "billing"),
        ("My payment card was declined", "billing"),
        ("How do I cancel my subscription?", "billing"),
        ("What are your business hours?", "general"),
        ("Do you have an office in Berlin?", "general"),
        ("Who should I contact about a partnership?", "general"),
    ]
    .into_iter()
    .map(|(text, label)| Example::new(text, label))
    .collect()
}
