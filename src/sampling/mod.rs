//! Beta/Gamma sampling kernel and the interchangeable bandit implementations
//!
//! `BanditOps` is the seam between the bandit model and the code that does the
//! numeric work. `ReferenceOps` is always available; `ParallelOps` is an
//! optional accelerated implementation. The execution router decides which one
//! serves a given call.
//!
//! Beta sampling uses the Gamma ratio: Beta(a, b) = X / (X + Y) with
//! X ~ Gamma(a), Y ~ Gamma(b). Gamma draws use Marsaglia-Tsang.
//!
//! Reference: Marsaglia, G., & Tsang, W. W. (2000).
//! "A simple method for generating gamma variables."

mod parallel;

pub use parallel::ParallelOps;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::OpsError;
use crate::router::BanditOperation;
use crate::sanitize::EPSILON;

/// Maximum rejection iterations per Gamma draw
pub const MAX_GAMMA_ITERATIONS: usize = 1000;

/// Maximum shape < 1 transform depth per Gamma draw
pub const MAX_GAMMA_TRANSFORM_DEPTH: usize = 10;

/// RNG shared by every implementation so results are reproducible per seed.
pub type BanditRng = ChaCha8Rng;

// ==================== Data Structures ====================

/// Beta distribution parameters
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BetaParams {
    /// Success mass (alpha > 0)
    pub alpha: f64,
    /// Failure mass (beta > 0)
    pub beta: f64,
}

impl BetaParams {
    /// Create new Beta parameters, flooring both at EPSILON
    pub fn new(alpha: f64, beta: f64) -> Self {
        let floor = |v: f64| if v.is_finite() { v.max(EPSILON) } else { 1.0 };
        Self {
            alpha: floor(alpha),
            beta: floor(beta),
        }
    }

    /// Mean of the Beta distribution
    pub fn expected_value(&self) -> f64 {
        let sum = self.alpha + self.beta;
        if sum > 0.0 && sum.is_finite() {
            (self.alpha / sum).clamp(0.0, 1.0)
        } else {
            0.5
        }
    }

    pub fn total(&self) -> f64 {
        self.alpha + self.beta
    }

    /// Observations beyond the prior mass
    pub fn observations(&self, prior_total: f64) -> f64 {
        (self.total() - prior_total).max(0.0)
    }

    pub fn is_valid(&self) -> bool {
        self.alpha.is_finite() && self.alpha > 0.0 && self.beta.is_finite() && self.beta > 0.0
    }
}

/// Global and contextual parameters of one candidate arm
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ArmParams {
    pub global: BetaParams,
    pub contextual: BetaParams,
}

/// Sampled score of one candidate arm
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ArmScore {
    pub score: f64,
    pub global_sample: f64,
    pub contextual_sample: f64,
}

/// Global/contextual blending rule
///
/// - Contextual tier without data beyond the prior: global sample only
/// - Otherwise the contextual weight grows with its share of observations,
///   bounded by `[min_weight, max_weight]`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlendPolicy {
    pub prior_total: f64,
    pub min_weight: f64,
    pub max_weight: f64,
}

impl BlendPolicy {
    pub fn context_weight(&self, global: &BetaParams, contextual: &BetaParams) -> Option<f64> {
        let contextual_total = contextual.total();
        if contextual_total <= self.prior_total {
            return None;
        }
        let raw = contextual_total / (contextual_total + global.total() + 1.0);
        Some(
            (self.min_weight + raw * (self.max_weight - self.min_weight))
                .clamp(self.min_weight, self.max_weight),
        )
    }

    pub fn blend(
        &self,
        global_sample: f64,
        contextual_sample: f64,
        global: &BetaParams,
        contextual: &BetaParams,
    ) -> f64 {
        match self.context_weight(global, contextual) {
            None => global_sample,
            Some(weight) => {
                (weight * contextual_sample + (1.0 - weight) * global_sample).clamp(0.0, 1.0)
            }
        }
    }
}

// ==================== Sampling Kernel ====================

/// Standard normal via Box-Muller
fn sample_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(EPSILON);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Gamma(shape, scale) draw.
///
/// Shape < 1 is lifted to `1 + shape` and corrected by `u^(1/shape)`. A finite
/// shape needs a single lift; `MAX_GAMMA_TRANSFORM_DEPTH` only bounds the loop.
/// When either budget runs out the draw returns the mean `shape * scale`.
pub fn sample_gamma<R: Rng + ?Sized>(rng: &mut R, shape: f64, scale: f64) -> f64 {
    sample_gamma_bounded(
        rng,
        shape,
        scale,
        MAX_GAMMA_TRANSFORM_DEPTH,
        MAX_GAMMA_ITERATIONS,
    )
}

fn sample_gamma_bounded<R: Rng + ?Sized>(
    rng: &mut R,
    shape: f64,
    scale: f64,
    max_depth: usize,
    max_iterations: usize,
) -> f64 {
    if !shape.is_finite() || shape <= 0.0 || !scale.is_finite() || scale <= 0.0 {
        return 0.0;
    }
    let mean = shape * scale;

    let mut current = shape;
    let mut multiplier = 1.0;
    let mut depth = 0;
    while current < 1.0 {
        if depth >= max_depth {
            return mean;
        }
        let u: f64 = rng.gen::<f64>().max(EPSILON);
        multiplier *= u.powf(1.0 / current);
        current += 1.0;
        depth += 1;
    }

    let d = current - 1.0 / 3.0;
    let c = 1.0 / (9.0 * d).sqrt();

    for _ in 0..max_iterations {
        let x = sample_normal(rng);
        let v_term = 1.0 + c * x;
        if v_term <= 0.0 {
            continue;
        }

        let v = v_term.powi(3);
        let u: f64 = rng.gen();
        let x2 = x * x;

        // Fast acceptance check
        if u < 1.0 - 0.0331 * x2 * x2 {
            return d * v * scale * multiplier;
        }
        if u.ln() < 0.5 * x2 + d * (1.0 - v + v.ln()) {
            return d * v * scale * multiplier;
        }
    }

    mean
}

/// Beta(alpha, beta) draw in [0, 1]; 0.5 when the Gamma sum degenerates.
pub fn sample_beta<R: Rng + ?Sized>(rng: &mut R, alpha: f64, beta: f64) -> f64 {
    let params = BetaParams::new(alpha, beta);

    let x = sample_gamma(rng, params.alpha, 1.0);
    let y = sample_gamma(rng, params.beta, 1.0);

    let sum = x + y;
    if sum > 0.0 && sum.is_finite() {
        (x / sum).clamp(0.0, 1.0)
    } else {
        0.5
    }
}

fn score_arm<R: Rng + ?Sized>(rng: &mut R, arm: &ArmParams, policy: &BlendPolicy) -> ArmScore {
    let global_sample = sample_beta(rng, arm.global.alpha, arm.global.beta);
    let contextual_sample = sample_beta(rng, arm.contextual.alpha, arm.contextual.beta);
    ArmScore {
        score: policy.blend(global_sample, contextual_sample, &arm.global, &arm.contextual),
        global_sample,
        contextual_sample,
    }
}

// ==================== Implementations ====================

/// One interface over the bandit's numeric operations.
pub trait BanditOps: Send + Sync {
    fn name(&self) -> &'static str;

    fn sample_beta(&self, rng: &mut BanditRng, params: BetaParams) -> Result<f64, OpsError>;

    fn batch_sample(
        &self,
        rng: &mut BanditRng,
        params: &[BetaParams],
    ) -> Result<Vec<f64>, OpsError>;

    fn score_actions(
        &self,
        rng: &mut BanditRng,
        arms: &[ArmParams],
        policy: &BlendPolicy,
    ) -> Result<Vec<ArmScore>, OpsError>;

    fn expected_value(&self, params: BetaParams) -> Result<f64, OpsError>;
}

/// Sequential implementation; the fallback for every routed call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceOps;

impl ReferenceOps {
    pub fn draw_beta(&self, rng: &mut BanditRng, params: BetaParams) -> f64 {
        sample_beta(rng, params.alpha, params.beta)
    }

    pub fn draw_batch(&self, rng: &mut BanditRng, params: &[BetaParams]) -> Vec<f64> {
        params
            .iter()
            .map(|p| sample_beta(rng, p.alpha, p.beta))
            .collect()
    }

    pub fn score_arms(
        &self,
        rng: &mut BanditRng,
        arms: &[ArmParams],
        policy: &BlendPolicy,
    ) -> Vec<ArmScore> {
        arms.iter().map(|arm| score_arm(rng, arm, policy)).collect()
    }

    pub fn mean(&self, params: BetaParams) -> f64 {
        params.expected_value()
    }
}

impl BanditOps for ReferenceOps {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn sample_beta(&self, rng: &mut BanditRng, params: BetaParams) -> Result<f64, OpsError> {
        Ok(self.draw_beta(rng, params))
    }

    fn batch_sample(
        &self,
        rng: &mut BanditRng,
        params: &[BetaParams],
    ) -> Result<Vec<f64>, OpsError> {
        Ok(self.draw_batch(rng, params))
    }

    fn score_actions(
        &self,
        rng: &mut BanditRng,
        arms: &[ArmParams],
        policy: &BlendPolicy,
    ) -> Result<Vec<ArmScore>, OpsError> {
        Ok(self.score_arms(rng, arms, policy))
    }

    fn expected_value(&self, params: BetaParams) -> Result<f64, OpsError> {
        Ok(self.mean(params))
    }
}

pub(crate) fn reject_invalid(
    operation: BanditOperation,
    params: impl IntoIterator<Item = BetaParams>,
) -> Result<(), OpsError> {
    match params.into_iter().find(|p| !p.is_valid()) {
        Some(p) => Err(OpsError::Failed {
            operation,
            message: format!("invalid beta params alpha={} beta={}", p.alpha, p.beta),
        }),
        None => Ok(()),
    }
}

// ==================== Unit Tests ====================
