//! Rayon-backed accelerated implementation.
//!
//! One seed per item is drawn from the caller's RNG up front, then items are
//! sampled on the rayon pool with their own `ChaCha8Rng`. Output is therefore
//! reproducible for a given caller seed, but differs from `ReferenceOps`.

use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use super::{
    reject_invalid, sample_beta, score_arm, ArmParams, ArmScore, BanditOps, BanditRng,
    BetaParams, BlendPolicy,
};
use crate::error::OpsError;
use crate::router::BanditOperation;

#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelOps;

impl ParallelOps {
    pub fn new() -> Self {
        Self
    }

    fn seeds(rng: &mut BanditRng, n: usize) -> Vec<u64> {
        (0..n).map(|_| rng.gen::<u64>()).collect()
    }
}

impl BanditOps for ParallelOps {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn sample_beta(&self, rng: &mut BanditRng, params: BetaParams) -> Result<f64, OpsError> {
        reject_invalid(BanditOperation::SampleBeta, [params])?;
        Ok(sample_beta(rng, params.alpha, params.beta))
    }

    fn batch_sample(
        &self,
        rng: &mut BanditRng,
        params: &[BetaParams],
    ) -> Result<Vec<f64>, OpsError> {
        reject_invalid(BanditOperation::BatchSample, params.iter().copied())?;
        let seeds = Self::seeds(rng, params.len());

        Ok(params
            .par_iter()
            .zip(seeds.par_iter())
            .map(|(p, &seed)| {
                let mut local = BanditRng::seed_from_u64(seed);
                sample_beta(&mut local, p.alpha, p.beta)
            })
            .collect())
    }

    fn score_actions(
        &self,
        rng: &mut BanditRng,
        arms: &[ArmParams],
        policy: &BlendPolicy,
    ) -> Result<Vec<ArmScore>, OpsError> {
        reject_invalid(
            BanditOperation::ScoreActions,
            arms.iter().flat_map(|a| [a.global, a.contextual]),
        )?;
        let seeds = Self::seeds(rng, arms.len());

        Ok(arms
            .par_iter()
            .zip(seeds.par_iter())
            .map(|(arm, &seed)| {
                let mut local = BanditRng::seed_from_u64(seed);
                score_arm(&mut local, arm, policy)
            })
            .collect())
    }

    fn expected_value(&self, params: BetaParams) -> Result<f64, OpsError> {
        reject_invalid(BanditOperation::ExpectedValue, [params])?;
        Ok(params.expected_value())
    }
}
