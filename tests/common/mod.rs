#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use danci_decision::router::{BanditOperation, CircuitBreaker, ExecutionRouter, ManualClock};
use danci_decision::sampling::{ArmParams, ArmScore, BlendPolicy};
use danci_decision::{
    Action, BanditContext, BanditOps, BanditRng, BetaParams, CircuitBreakerConfig, Difficulty,
    OpsError, ReferenceOps, RouterConfig,
};

/// 可切换健康状态的加速实现：健康时委托 ReferenceOps，否则返回错误
#[derive(Default)]
pub struct FlakyOps {
    failing: AtomicBool,
    calls: AtomicU64,
}

impl FlakyOps {
    pub fn failing() -> Self {
        let ops = Self::default();
        ops.set_failing(true);
        ops
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self, operation: BanditOperation) -> Result<(), OpsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(OpsError::Failed {
                operation,
                message: "simulated accelerator fault".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

impl BanditOps for FlakyOps {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn sample_beta(&self, rng: &mut BanditRng, params: BetaParams) -> Result<f64, OpsError> {
        self.check(BanditOperation::SampleBeta)?;
        ReferenceOps.sample_beta(rng, params)
    }

    fn batch_sample(&self, rng: &mut BanditRng, params: &[BetaParams]) -> Result<Vec<f64>, OpsError> {
        self.check(BanditOperation::BatchSample)?;
        ReferenceOps.batch_sample(rng, params)
    }

    fn score_actions(
        &self,
        rng: &mut BanditRng,
        arms: &[ArmParams],
        policy: &BlendPolicy,
    ) -> Result<Vec<ArmScore>, OpsError> {
        self.check(BanditOperation::ScoreActions)?;
        ReferenceOps.score_actions(rng, arms, policy)
    }

    fn expected_value(&self, params: BetaParams) -> Result<f64, OpsError> {
        self.check(BanditOperation::ExpectedValue)?;
        ReferenceOps.expected_value(params)
    }
}

/// Router with a manual clock and the given accelerated implementation.
pub fn router_with(
    ops: Arc<dyn BanditOps>,
    clock: Arc<ManualClock>,
) -> (Arc<ExecutionRouter>, Arc<CircuitBreaker>) {
    let breaker = Arc::new(CircuitBreaker::with_clock(CircuitBreakerConfig::default(), clock));
    let router = ExecutionRouter::new(&RouterConfig::default(), Arc::clone(&breaker))
        .with_accelerated(ops);
    (Arc::new(router), breaker)
}

pub fn params(n: usize) -> Vec<BetaParams> {
    (0..n)
        .map(|i| BetaParams::new(1.0 + i as f64, 2.0))
        .collect()
}

/// n distinct candidate actions
pub fn action_grid(n: usize) -> Vec<Action> {
    let difficulties = [Difficulty::Easy, Difficulty::Mid, Difficulty::Hard];
    (0..n)
        .map(|i| Action {
            interval_scale: 0.8 + 0.1 * (i % 5) as f64,
            new_ratio: 0.1 + 0.05 * (i % 4) as f64,
            difficulty: difficulties[i % 3],
            batch_size: 5 + i as i32,
            hint_level: (i % 3) as i32,
        })
        .collect()
}

pub fn sample_context() -> BanditContext {
    BanditContext::new(0.15, 2_400.0, 14)
}
