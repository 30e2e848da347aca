use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::UserType;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BanditConfig {
    pub prior_alpha: f64,
    pub prior_beta: f64,
    pub min_context_weight: f64,
    pub max_context_weight: f64,
    pub enable_soft_update: bool,
    pub confidence_scale: f64,
    /// 上下文层参数上限，超出后按最近使用淘汰到一半
    pub max_contextual_arms: usize,
    /// Fixed seed for reproducible sampling; `None` seeds from the clock.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            prior_alpha: 1.0,
            prior_beta: 1.0,
            min_context_weight: 0.35,
            max_context_weight: 0.75,
            enable_soft_update: false,
            confidence_scale: 20.0,
            max_contextual_arms: 1000,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ColdStartConfig {
    pub probe_sequence: Vec<UserType>,
    pub min_classify_probes: usize,
    pub confidence_threshold: f64,
    pub explore_threshold: u32,
    pub max_results: usize,
}

impl Default for ColdStartConfig {
    fn default() -> Self {
        Self {
            probe_sequence: vec![UserType::Fast, UserType::Stable, UserType::Cautious],
            min_classify_probes: 2,
            confidence_threshold: 0.8,
            explore_threshold: 8,
            max_results: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    pub window_size: usize,
    pub failure_threshold: f64,
    pub minimum_samples: usize,
    pub open_duration_ms: u64,
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            failure_threshold: 0.5,
            minimum_samples: 10,
            open_duration_ms: 60_000,
            half_open_max_probes: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterConfig {
    pub batch_sample_threshold: usize,
    pub score_actions_threshold: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            batch_sample_threshold: 50,
            score_actions_threshold: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DecisionConfig {
    #[serde(default)]
    pub bandit: BanditConfig,
    #[serde(default)]
    pub cold_start: ColdStartConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub router: RouterConfig,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable decision config override");
            None
        }
    }
}

impl DecisionConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = env_parse("DECISION_PRIOR_ALPHA") {
            config.bandit.prior_alpha = val;
        }
        if let Some(val) = env_parse("DECISION_PRIOR_BETA") {
            config.bandit.prior_beta = val;
        }
        if let Some(val) = env_parse("DECISION_SOFT_UPDATE") {
            config.bandit.enable_soft_update = val;
        }
        if let Some(val) = env_parse("DECISION_MAX_CONTEXTUAL_ARMS") {
            config.bandit.max_contextual_arms = val;
        }
        if let Some(val) = env_parse("DECISION_SEED") {
            config.bandit.seed = Some(val);
        }
        if let Some(val) = env_parse("DECISION_COLDSTART_CONFIDENCE") {
            config.cold_start.confidence_threshold = val;
        }
        if let Some(val) = env_parse("DECISION_COLDSTART_EXPLORE_THRESHOLD") {
            config.cold_start.explore_threshold = val;
        }
        if let Some(val) = env_parse("DECISION_BREAKER_WINDOW") {
            config.circuit_breaker.window_size = val;
        }
        if let Some(val) = env_parse("DECISION_BREAKER_FAILURE_THRESHOLD") {
            config.circuit_breaker.failure_threshold = val;
        }
        if let Some(val) = env_parse("DECISION_BREAKER_OPEN_MS") {
            config.circuit_breaker.open_duration_ms = val;
        }
        if let Some(val) = env_parse("DECISION_BREAKER_HALF_OPEN_PROBES") {
            config.circuit_breaker.half_open_max_probes = val;
        }
        if let Some(val) = env_parse("DECISION_ROUTER_BATCH_THRESHOLD") {
            config.router.batch_sample_threshold = val;
        }
        if let Some(val) = env_parse("DECISION_ROUTER_SCORE_THRESHOLD") {
            config.router.score_actions_threshold = val;
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.bandit;
        if !(b.prior_alpha.is_finite() && b.prior_alpha > 0.0) {
            return Err(ConfigError::invalid("bandit.priorAlpha", "must be finite and > 0"));
        }
        if !(b.prior_beta.is_finite() && b.prior_beta > 0.0) {
            return Err(ConfigError::invalid("bandit.priorBeta", "must be finite and > 0"));
        }
        if !(0.0..=1.0).contains(&b.min_context_weight)
            || !(0.0..=1.0).contains(&b.max_context_weight)
            || b.min_context_weight > b.max_context_weight
        {
            return Err(ConfigError::invalid(
                "bandit.contextWeight",
                format!(
                    "expected 0 <= min ({}) <= max ({}) <= 1",
                    b.min_context_weight, b.max_context_weight
                ),
            ));
        }
        if !(b.confidence_scale.is_finite() && b.confidence_scale > 0.0) {
            return Err(ConfigError::invalid("bandit.confidenceScale", "must be finite and > 0"));
        }
        if b.max_contextual_arms < 2 {
            return Err(ConfigError::invalid("bandit.maxContextualArms", "must be >= 2"));
        }

        let c = &self.cold_start;
        if c.probe_sequence.is_empty() {
            return Err(ConfigError::invalid("coldStart.probeSequence", "must not be empty"));
        }
        if !(c.confidence_threshold > 0.0 && c.confidence_threshold <= 1.0) {
            return Err(ConfigError::invalid(
                "coldStart.confidenceThreshold",
                "must be within (0, 1]",
            ));
        }
        if (c.explore_threshold as usize) < c.probe_sequence.len() {
            return Err(ConfigError::invalid(
                "coldStart.exploreThreshold",
                "must cover at least the probe sequence",
            ));
        }
        if c.max_results == 0 {
            return Err(ConfigError::invalid("coldStart.maxResults", "must be > 0"));
        }

        let cb = &self.circuit_breaker;
        if cb.window_size == 0 {
            return Err(ConfigError::invalid("circuitBreaker.windowSize", "must be > 0"));
        }
        if !(cb.failure_threshold > 0.0 && cb.failure_threshold <= 1.0) {
            return Err(ConfigError::invalid(
                "circuitBreaker.failureThreshold",
                "must be within (0, 1]",
            ));
        }
        if cb.minimum_samples > cb.window_size {
            return Err(ConfigError::invalid(
                "circuitBreaker.minimumSamples",
                "cannot exceed the window size",
            ));
        }
        if cb.half_open_max_probes == 0 {
            return Err(ConfigError::invalid("circuitBreaker.halfOpenMaxProbes", "must be > 0"));
        }

        Ok(())
    }
}
