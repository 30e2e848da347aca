//! Execution routing between the reference and the accelerated bandit ops
//!
//! `SmartRouter` holds the static per-operation policy, `CircuitBreaker`
//! tracks accelerated-path health, and `ExecutionRouter` combines both around
//! an always-present `ReferenceOps` and an optional accelerated `BanditOps`.
//! Accelerated failures (errors, panics, invalid output) are recorded and the
//! call is replayed on the reference path, so callers always get a result.

pub mod circuit_breaker;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerSnapshot, CircuitEvent, CircuitState, CircuitStateChange,
    Clock, ManualClock, SystemClock,
};

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::{DecisionConfig, RouterConfig};
use crate::error::OpsError;
use crate::sampling::{
    ArmParams, ArmScore, BanditOps, BanditRng, BetaParams, BlendPolicy, ReferenceOps,
};
use crate::sanitize::all_probabilities;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BanditOperation {
    SampleBeta,
    BatchSample,
    ScoreActions,
    ExpectedValue,
}

impl BanditOperation {
    pub const COUNT: usize = 4;
    pub const ALL: [BanditOperation; Self::COUNT] = [
        BanditOperation::SampleBeta,
        BanditOperation::BatchSample,
        BanditOperation::ScoreActions,
        BanditOperation::ExpectedValue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SampleBeta => "sampleBeta",
            Self::BatchSample => "batchSample",
            Self::ScoreActions => "scoreActions",
            Self::ExpectedValue => "expectedValue",
        }
    }

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for BanditOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteDecision {
    Fast,
    Reference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutePolicy {
    /// Acceleration overhead exceeds the work saved.
    ReferenceOnly,
    /// Fast path once the input reaches this size.
    MinSize(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteRequest {
    pub data_size: Option<usize>,
    pub fast_path_available: bool,
}

#[derive(Debug, Default)]
struct RouteCounter {
    fast: AtomicU64,
    reference: AtomicU64,
}

/// Static per-operation routing policy with call counters.
#[derive(Debug)]
pub struct SmartRouter {
    batch_sample_threshold: usize,
    score_actions_threshold: usize,
    counters: [RouteCounter; BanditOperation::COUNT],
}

impl Default for SmartRouter {
    fn default() -> Self {
        Self::new(&RouterConfig::default())
    }
}

impl SmartRouter {
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            batch_sample_threshold: config.batch_sample_threshold,
            score_actions_threshold: config.score_actions_threshold,
            counters: std::array::from_fn(|_| RouteCounter::default()),
        }
    }

    pub fn policy(&self, operation: BanditOperation) -> RoutePolicy {
        match operation {
            BanditOperation::SampleBeta | BanditOperation::ExpectedValue => {
                RoutePolicy::ReferenceOnly
            }
            BanditOperation::BatchSample => RoutePolicy::MinSize(self.batch_sample_threshold),
            BanditOperation::ScoreActions => RoutePolicy::MinSize(self.score_actions_threshold),
        }
    }

    /// Policy check alone, without breaker health.
    pub fn is_fast_eligible(&self, operation: BanditOperation, data_size: Option<usize>) -> bool {
        match self.policy(operation) {
            RoutePolicy::ReferenceOnly => false,
            RoutePolicy::MinSize(threshold) => data_size.is_some_and(|size| size >= threshold),
        }
    }

    pub fn decide(&self, operation: BanditOperation, request: RouteRequest) -> RouteDecision {
        let decision = if request.fast_path_available
            && self.is_fast_eligible(operation, request.data_size)
        {
            RouteDecision::Fast
        } else {
            RouteDecision::Reference
        };

        let counter = &self.counters[operation.index()];
        match decision {
            RouteDecision::Fast => counter.fast.fetch_add(1, Ordering::Relaxed),
            RouteDecision::Reference => counter.reference.fetch_add(1, Ordering::Relaxed),
        };
        decision
    }

    pub fn route_counts(&self, operation: BanditOperation) -> (u64, u64) {
        let counter = &self.counters[operation.index()];
        (
            counter.fast.load(Ordering::Relaxed),
            counter.reference.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStats {
    pub operation: BanditOperation,
    pub fast: u64,
    pub reference: u64,
    pub fallbacks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStats {
    pub accelerated: Option<String>,
    pub operations: Vec<OperationStats>,
    pub breaker: CircuitBreakerSnapshot,
}

pub struct ExecutionRouter {
    smart: SmartRouter,
    breaker: Arc<CircuitBreaker>,
    reference: ReferenceOps,
    accelerated: Option<Arc<dyn BanditOps>>,
    fallbacks: [AtomicU64; BanditOperation::COUNT],
}

impl std::fmt::Debug for ExecutionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRouter")
            .field("smart", &self.smart)
            .field("breaker", &self.breaker)
            .field("accelerated", &self.accelerated.as_ref().map(|ops| ops.name()))
            .finish()
    }
}

impl Default for ExecutionRouter {
    fn default() -> Self {
        Self::new(&RouterConfig::default(), Arc::new(CircuitBreaker::default()))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl ExecutionRouter {
    pub fn new(config: &RouterConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            smart: SmartRouter::new(config),
            breaker,
            reference: ReferenceOps,
            accelerated: None,
            fallbacks: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn from_config(config: &DecisionConfig) -> Self {
        Self::new(
            &config.router,
            Arc::new(CircuitBreaker::new(config.circuit_breaker.clone())),
        )
    }

    pub fn with_accelerated(mut self, ops: Arc<dyn BanditOps>) -> Self {
        self.accelerated = Some(ops);
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn smart_router(&self) -> &SmartRouter {
        &self.smart
    }

    pub fn has_accelerated(&self) -> bool {
        self.accelerated.is_some()
    }

    /// Routing decision for one call. The breaker is only consulted when the
    /// policy could pick the fast path, so pinned calls never spend
    /// half-open probes.
    fn route(&self, operation: BanditOperation, data_size: Option<usize>) -> Option<&dyn BanditOps> {
        let eligible =
            self.accelerated.is_some() && self.smart.is_fast_eligible(operation, data_size);
        let fast_path_available = eligible && self.breaker.can_execute();
        let decision = self.smart.decide(
            operation,
            RouteRequest {
                data_size,
                fast_path_available,
            },
        );
        match decision {
            RouteDecision::Fast => self.accelerated.as_deref(),
            RouteDecision::Reference => None,
        }
    }

    /// Runs an accelerated call isolated from errors and panics, validates the
    /// output and reports the outcome to the breaker.
    fn run_fast<T>(
        &self,
        operation: BanditOperation,
        call: impl FnOnce() -> Result<T, OpsError>,
        validate: impl FnOnce(&T) -> Result<(), String>,
    ) -> Option<T> {
        let started = Instant::now();
        let outcome = match panic::catch_unwind(AssertUnwindSafe(call)) {
            Ok(Ok(value)) => match validate(&value) {
                Ok(()) => Ok(value),
                Err(message) => Err(OpsError::InvalidOutput { operation, message }),
            },
            Ok(Err(err)) => Err(err),
            Err(payload) => Err(OpsError::Panicked {
                operation,
                message: panic_message(&*payload),
            }),
        };
        let latency = started.elapsed();

        match outcome {
            Ok(value) => {
                self.breaker.record_success_with_latency(latency);
                Some(value)
            }
            Err(err) => {
                tracing::warn!(
                    operation = %operation,
                    error = %err,
                    "Accelerated path failed, falling back to reference"
                );
                self.fallbacks[operation.index()].fetch_add(1, Ordering::Relaxed);
                self.breaker.record_failure_with_latency(err.to_string(), latency);
                None
            }
        }
    }

    pub fn sample_beta(&self, rng: &mut BanditRng, params: BetaParams) -> f64 {
        let operation = BanditOperation::SampleBeta;
        if let Some(fast) = self.route(operation, Some(1)) {
            let result = self.run_fast(
                operation,
                || fast.sample_beta(rng, params),
                |v| check_probabilities(std::slice::from_ref(v)),
            );
            if let Some(value) = result {
                return value;
            }
        }
        self.reference.draw_beta(rng, params)
    }

    pub fn batch_sample(&self, rng: &mut BanditRng, params: &[BetaParams]) -> Vec<f64> {
        let operation = BanditOperation::BatchSample;
        if let Some(fast) = self.route(operation, Some(params.len())) {
            let result = self.run_fast(
                operation,
                || fast.batch_sample(rng, params),
                |values| {
                    check_len(values.len(), params.len())?;
                    check_probabilities(values)
                },
            );
            if let Some(values) = result {
                return values;
            }
        }
        self.reference.draw_batch(rng, params)
    }

    pub fn score_actions(
        &self,
        rng: &mut BanditRng,
        arms: &[ArmParams],
        policy: &BlendPolicy,
    ) -> Vec<ArmScore> {
        let operation = BanditOperation::ScoreActions;
        if let Some(fast) = self.route(operation, Some(arms.len())) {
            let result = self.run_fast(
                operation,
                || fast.score_actions(rng, arms, policy),
                |scores| {
                    check_len(scores.len(), arms.len())?;
                    let flat: Vec<f64> = scores
                        .iter()
                        .flat_map(|s| [s.score, s.global_sample, s.contextual_sample])
                        .collect();
                    check_probabilities(&flat)
                },
            );
            if let Some(scores) = result {
                return scores;
            }
        }
        self.reference.score_arms(rng, arms, policy)
    }

    pub fn expected_value(&self, params: BetaParams) -> f64 {
        let operation = BanditOperation::ExpectedValue;
        if let Some(fast) = self.route(operation, Some(1)) {
            let result = self.run_fast(
                operation,
                || fast.expected_value(params),
                |v| check_probabilities(std::slice::from_ref(v)),
            );
            if let Some(value) = result {
                return value;
            }
        }
        self.reference.mean(params)
    }

    pub fn fallback_count(&self, operation: BanditOperation) -> u64 {
        self.fallbacks[operation.index()].load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            accelerated: self.accelerated.as_ref().map(|ops| ops.name().to_string()),
            operations: BanditOperation::ALL
                .iter()
                .map(|&operation| {
                    let (fast, reference) = self.smart.route_counts(operation);
                    OperationStats {
                        operation,
                        fast,
                        reference,
                        fallbacks: self.fallback_count(operation),
                    }
                })
                .collect(),
            breaker: self.breaker.snapshot(),
        }
    }
}

fn check_len(actual: usize, expected: usize) -> Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("expected {expected} values, got {actual}"))
    }
}

fn check_probabilities(values: &[f64]) -> Result<(), String> {
    if all_probabilities(values) {
        Ok(())
    } else {
        Err("values must be finite and within [0, 1]".to_string())
    }
}
