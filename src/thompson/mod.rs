//! Contextual Thompson Sampling
//!
//! Core principles:
//! - Maintains Beta distribution parameters (alpha, beta) for each action
//! - During selection, samples from Beta(alpha, beta) and selects the action with the highest sample
//! - Positive feedback -> alpha + 1, negative feedback -> beta + 1
//! - Keeps a global tier per action and a contextual tier per (action, context bucket)
//!
//! Every sampling call goes through the shared [`ExecutionRouter`], which picks
//! the reference or the accelerated implementation per call.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::SeedableRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coldstart::ExplorationPolicy;
use crate::config::BanditConfig;
use crate::error::DecisionError;
use crate::router::ExecutionRouter;
use crate::sampling::{ArmParams, BanditRng, BetaParams, BlendPolicy};
use crate::sanitize::{
    clamp_reward, json_count, json_number, lenient_count, lenient_f64, missing_f64,
    sanitize_beta_param, sanitize_prior,
};
use crate::types::{Action, ActionKey, BanditContext, ContextKey};

pub const SNAPSHOT_VERSION: &str = "2.0.0";

// ==================== Data Structures ====================

/// Action selection result
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSelection {
    pub action: Action,
    /// Blended sample of the winning action, [0, 1]
    pub score: f64,
    /// Confidence level [0, 1]
    pub confidence: f64,
    pub global_sample: f64,
    pub contextual_sample: f64,
}

/// Batch update item
#[derive(Clone, Debug)]
pub struct BatchUpdateItem {
    pub action: Action,
    pub context: BanditContext,
    pub reward: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalParamsEntry {
    pub action: ActionKey,
    #[serde(default = "missing_f64", deserialize_with = "lenient_f64")]
    pub alpha: f64,
    #[serde(default = "missing_f64", deserialize_with = "lenient_f64")]
    pub beta: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextualParamsEntry {
    pub action: ActionKey,
    pub context: ContextKey,
    #[serde(default = "missing_f64", deserialize_with = "lenient_f64")]
    pub alpha: f64,
    #[serde(default = "missing_f64", deserialize_with = "lenient_f64")]
    pub beta: f64,
    /// 最近使用序号，决定淘汰顺序
    #[serde(default, deserialize_with = "lenient_count")]
    pub last_used: i64,
}

fn default_version() -> String {
    SNAPSHOT_VERSION.to_string()
}

/// Serializable state for persistence
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanditSnapshot {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "missing_f64", deserialize_with = "lenient_f64")]
    pub prior_alpha: f64,
    #[serde(default = "missing_f64", deserialize_with = "lenient_f64")]
    pub prior_beta: f64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub update_count: i64,
    #[serde(default)]
    pub global: Vec<GlobalParamsEntry>,
    #[serde(default)]
    pub contextual: Vec<ContextualParamsEntry>,
}

impl Default for BanditSnapshot {
    fn default() -> Self {
        Self {
            version: default_version(),
            prior_alpha: 1.0,
            prior_beta: 1.0,
            update_count: 0,
            global: Vec::new(),
            contextual: Vec::new(),
        }
    }
}

/// 逐条解析，只丢弃键无法读取的条目
fn parse_entries<T: DeserializeOwned>(value: Option<&Value>) -> (Vec<T>, usize) {
    let raw = value.and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]);
    let entries: Vec<T> = raw
        .iter()
        .filter_map(|entry| T::deserialize(entry).ok())
        .collect();
    let skipped = raw.len() - entries.len();
    (entries, skipped)
}

impl BanditSnapshot {
    /// Lenient parse of a stored document.
    ///
    /// Numbers degrade to invalid markers that `set_state` repairs; a
    /// malformed entry drops only that entry.
    pub fn from_value(value: &Value) -> Self {
        let (global, skipped_global) = parse_entries(value.get("global"));
        let (contextual, skipped_contextual) = parse_entries(value.get("contextual"));
        if skipped_global + skipped_contextual > 0 {
            tracing::warn!(
                skipped_global,
                skipped_contextual,
                "Dropping unreadable bandit entries"
            );
        }

        Self {
            version: value
                .get("version")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(default_version),
            prior_alpha: json_number(value.get("priorAlpha")),
            prior_beta: json_number(value.get("priorBeta")),
            update_count: json_count(value.get("updateCount")),
            global,
            contextual,
        }
    }
}

// ==================== Main Implementation ====================

#[derive(Clone, Copy, Debug)]
struct ContextArm {
    params: BetaParams,
    last_used: u64,
}

/// Context-aware Thompson Sampling bandit for one user.
///
/// Not synchronized: callers serialize access per user.
pub struct ContextualBanditModel {
    /// Global Beta parameters (indexed by action key)
    global_params: BTreeMap<ActionKey, BetaParams>,
    /// Contextual Beta parameters (indexed by action key + context bucket)
    context_params: BTreeMap<(ActionKey, ContextKey), ContextArm>,
    max_contextual_arms: usize,
    /// 上下文层访问序号
    access_tick: u64,
    router: Arc<ExecutionRouter>,
    rng: BanditRng,
    prior_alpha: f64,
    prior_beta: f64,
    min_context_weight: f64,
    max_context_weight: f64,
    enable_soft_update: bool,
    confidence_scale: f64,
    update_count: u64,
}

impl std::fmt::Debug for ContextualBanditModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextualBanditModel")
            .field("global_arms", &self.global_params.len())
            .field("contextual_arms", &self.context_params.len())
            .field("prior_alpha", &self.prior_alpha)
            .field("prior_beta", &self.prior_beta)
            .field("update_count", &self.update_count)
            .finish()
    }
}

fn clock_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(42)
}

impl ContextualBanditModel {
    /// Create a new instance with default options
    pub fn new(router: Arc<ExecutionRouter>) -> Self {
        Self::with_config(&BanditConfig::default(), router)
    }

    pub fn with_config(config: &BanditConfig, router: Arc<ExecutionRouter>) -> Self {
        let seed = config.seed.unwrap_or_else(clock_seed);
        let min_weight = config.min_context_weight.clamp(0.0, 1.0);
        let max_weight = config.max_context_weight.clamp(min_weight, 1.0);

        Self {
            global_params: BTreeMap::new(),
            context_params: BTreeMap::new(),
            max_contextual_arms: config.max_contextual_arms.max(2),
            access_tick: 0,
            router,
            rng: BanditRng::seed_from_u64(seed),
            prior_alpha: sanitize_prior(config.prior_alpha),
            prior_beta: sanitize_prior(config.prior_beta),
            min_context_weight: min_weight,
            max_context_weight: max_weight,
            enable_soft_update: config.enable_soft_update,
            confidence_scale: if config.confidence_scale.is_finite() && config.confidence_scale > 0.0
            {
                config.confidence_scale
            } else {
                20.0
            },
            update_count: 0,
        }
    }

    /// Create a new instance with a specific seed (for testing)
    pub fn with_seed(seed: u64, router: Arc<ExecutionRouter>) -> Self {
        let config = BanditConfig {
            seed: Some(seed),
            ..BanditConfig::default()
        };
        Self::with_config(&config, router)
    }

    pub fn router(&self) -> &Arc<ExecutionRouter> {
        &self.router
    }

    pub fn prior(&self) -> BetaParams {
        BetaParams {
            alpha: self.prior_alpha,
            beta: self.prior_beta,
        }
    }

    fn prior_total(&self) -> f64 {
        self.prior_alpha + self.prior_beta
    }

    fn blend_policy(&self) -> BlendPolicy {
        BlendPolicy {
            prior_total: self.prior_total(),
            min_weight: self.min_context_weight,
            max_weight: self.max_context_weight,
        }
    }

    // ==================== Sampling ====================

    /// Single Beta draw (pinned to the reference path)
    pub fn sample_beta(&mut self, alpha: f64, beta: f64) -> f64 {
        self.router
            .sample_beta(&mut self.rng, BetaParams::new(alpha, beta))
    }

    /// Global-tier sample for each action
    pub fn batch_sample(&mut self, actions: &[Action]) -> Vec<f64> {
        let params: Vec<BetaParams> = actions
            .iter()
            .map(|action| self.ensure_global_params(action.key()))
            .collect();
        self.router.batch_sample(&mut self.rng, &params)
    }

    // ==================== Action Selection ====================

    /// Select the best action for `context`
    ///
    /// Blends global and contextual samples based on data availability.
    /// Exact ties keep the earliest candidate.
    pub fn select_action(
        &mut self,
        actions: &[Action],
        context: &BanditContext,
    ) -> Result<ActionSelection, DecisionError> {
        if actions.is_empty() {
            return Err(DecisionError::EmptyActionSet);
        }

        let context_key = context.key();

        if let [only] = actions {
            let key = only.key();
            let global = self.ensure_global_params(key);
            let contextual = self.ensure_context_params(key, context_key);
            let score = self.router.expected_value(global);
            self.evict_stale_contexts();
            return Ok(ActionSelection {
                action: only.clone(),
                score,
                confidence: self.compute_confidence(&global, &contextual),
                global_sample: score,
                contextual_sample: self.router.expected_value(contextual),
            });
        }

        let arms: Vec<ArmParams> = actions
            .iter()
            .map(|action| {
                let key = action.key();
                ArmParams {
                    global: self.ensure_global_params(key),
                    contextual: self.ensure_context_params(key, context_key),
                }
            })
            .collect();

        self.evict_stale_contexts();

        let policy = self.blend_policy();
        let scores = self.router.score_actions(&mut self.rng, &arms, &policy);

        let mut best = 0;
        for (idx, candidate) in scores.iter().enumerate().skip(1) {
            if candidate.score > scores[best].score {
                best = idx;
            }
        }

        let winner = scores[best];
        Ok(ActionSelection {
            action: actions[best].clone(),
            score: winner.score.clamp(0.0, 1.0),
            confidence: self.compute_confidence(&arms[best].global, &arms[best].contextual),
            global_sample: winner.global_sample,
            contextual_sample: winner.contextual_sample,
        })
    }

    // ==================== Update Methods ====================

    /// Update both tiers with a reward in [-1, 1]
    ///
    /// - Binary mode (default): reward >= 0 -> success, < 0 -> failure
    /// - Soft update mode: alpha += (reward + 1) / 2, beta += (1 - reward) / 2
    pub fn update(&mut self, action: &Action, context: &BanditContext, reward: f64) {
        let safe_reward = clamp_reward(reward);
        let (alpha_gain, beta_gain) = if self.enable_soft_update {
            let normalized = (safe_reward + 1.0) / 2.0;
            (normalized, 1.0 - normalized)
        } else if safe_reward >= 0.0 {
            (1.0, 0.0)
        } else {
            (0.0, 1.0)
        };

        let prior = self.prior();
        let key = action.key();

        let global = self.global_params.entry(key).or_insert(prior);
        global.alpha += alpha_gain;
        global.beta += beta_gain;

        let contextual = self.touch_context(key, context.key());
        contextual.alpha += alpha_gain;
        contextual.beta += beta_gain;

        self.update_count += 1;
        self.evict_stale_contexts();
    }

    /// Batch update multiple actions
    pub fn batch_update(&mut self, items: &[BatchUpdateItem]) {
        for item in items {
            self.update(&item.action, &item.context, item.reward);
        }
    }

    // ==================== Query Methods ====================

    /// Global-tier mean; the prior mean for unseen actions
    pub fn get_expected_reward(&self, action: &Action) -> f64 {
        let params = self
            .global_params
            .get(&action.key())
            .copied()
            .unwrap_or_else(|| self.prior());
        self.router.expected_value(params)
    }

    pub fn get_expected_reward_in_context(&self, action: &Action, context: &BanditContext) -> f64 {
        let params = self
            .context_params
            .get(&(action.key(), context.key()))
            .map(|arm| arm.params)
            .unwrap_or_else(|| self.prior());
        self.router.expected_value(params)
    }

    /// Observations excluding prior
    pub fn get_sample_count(&self, action: &Action) -> f64 {
        self.global_params
            .get(&action.key())
            .map(|p| p.observations(self.prior_total()))
            .unwrap_or(0.0)
    }

    pub fn global_params(&self, action: &Action) -> Option<BetaParams> {
        self.global_params.get(&action.key()).copied()
    }

    pub fn contextual_params(&self, action: &Action, context: &BanditContext) -> Option<BetaParams> {
        self.context_params
            .get(&(action.key(), context.key()))
            .map(|arm| arm.params)
    }

    pub fn contextual_arm_count(&self) -> usize {
        self.context_params.len()
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    // ==================== State Management ====================

    /// Reset all parameters
    pub fn reset(&mut self) {
        self.global_params.clear();
        self.context_params.clear();
        self.access_tick = 0;
        self.update_count = 0;
    }

    /// Reseed the sampler (for testing)
    pub fn set_seed(&mut self, seed: u64) {
        self.rng = BanditRng::seed_from_u64(seed);
    }

    pub fn get_state(&self) -> BanditSnapshot {
        BanditSnapshot {
            version: SNAPSHOT_VERSION.to_string(),
            prior_alpha: self.prior_alpha,
            prior_beta: self.prior_beta,
            update_count: i64::try_from(self.update_count).unwrap_or(i64::MAX),
            global: self
                .global_params
                .iter()
                .map(|(action, p)| GlobalParamsEntry {
                    action: *action,
                    alpha: p.alpha,
                    beta: p.beta,
                })
                .collect(),
            contextual: self
                .context_params
                .iter()
                .map(|((action, context), arm)| ContextualParamsEntry {
                    action: *action,
                    context: *context,
                    alpha: arm.params.alpha,
                    beta: arm.params.beta,
                    last_used: i64::try_from(arm.last_used).unwrap_or(i64::MAX),
                })
                .collect(),
        }
    }

    /// Restore state, repairing invalid entries and migrating across a prior change
    ///
    /// `new = max(instance_prior, validated + (instance_prior - snapshot_prior))`
    pub fn set_state(&mut self, snapshot: &BanditSnapshot) {
        let delta = |instance: f64, stored: f64| {
            if stored.is_finite() && stored > 0.0 {
                instance - stored
            } else {
                0.0
            }
        };
        let alpha_delta = delta(self.prior_alpha, snapshot.prior_alpha);
        let beta_delta = delta(self.prior_beta, snapshot.prior_beta);
        let prior_alpha = self.prior_alpha;
        let prior_beta = self.prior_beta;

        let mut repaired = 0usize;
        let mut migrate = |alpha: f64, beta: f64| {
            let a = sanitize_beta_param(alpha, prior_alpha);
            let b = sanitize_beta_param(beta, prior_beta);
            if a != alpha || b != beta {
                repaired += 1;
            }
            BetaParams {
                alpha: (a + alpha_delta).max(prior_alpha),
                beta: (b + beta_delta).max(prior_beta),
            }
        };

        self.global_params = snapshot
            .global
            .iter()
            .map(|e| (e.action, migrate(e.alpha, e.beta)))
            .collect();
        self.context_params = snapshot
            .contextual
            .iter()
            .map(|e| {
                let arm = ContextArm {
                    params: migrate(e.alpha, e.beta),
                    last_used: u64::try_from(e.last_used).unwrap_or(0),
                };
                ((e.action, e.context), arm)
            })
            .collect();
        self.access_tick = self
            .context_params
            .values()
            .map(|arm| arm.last_used)
            .max()
            .unwrap_or(0);
        self.update_count = u64::try_from(snapshot.update_count).unwrap_or(0);
        self.evict_stale_contexts();

        if repaired > 0 || alpha_delta != 0.0 || beta_delta != 0.0 {
            tracing::debug!(
                repaired,
                alpha_delta,
                beta_delta,
                version = %snapshot.version,
                "Bandit state restored with repairs or prior migration"
            );
        }
    }

    // ==================== Private Helper Methods ====================

    fn ensure_global_params(&mut self, key: ActionKey) -> BetaParams {
        let prior = self.prior();
        *self.global_params.entry(key).or_insert(prior)
    }

    fn ensure_context_params(&mut self, key: ActionKey, context: ContextKey) -> BetaParams {
        *self.touch_context(key, context)
    }

    /// Contextual params, created at the prior and marked as most recently used
    fn touch_context(&mut self, key: ActionKey, context: ContextKey) -> &mut BetaParams {
        self.access_tick += 1;
        let tick = self.access_tick;
        let prior = self.prior();
        let arm = self
            .context_params
            .entry((key, context))
            .or_insert(ContextArm {
                params: prior,
                last_used: tick,
            });
        arm.last_used = tick;
        &mut arm.params
    }

    /// 超出上限时按最近使用淘汰到上限的一半
    fn evict_stale_contexts(&mut self) {
        if self.context_params.len() <= self.max_contextual_arms {
            return;
        }

        let mut by_age: Vec<(u64, (ActionKey, ContextKey))> = self
            .context_params
            .iter()
            .map(|(key, arm)| (arm.last_used, *key))
            .collect();
        by_age.sort_unstable();

        let to_remove = self.context_params.len() - self.max_contextual_arms / 2;
        for (_, key) in by_age.into_iter().take(to_remove) {
            self.context_params.remove(&key);
        }
        tracing::debug!(
            removed = to_remove,
            remaining = self.context_params.len(),
            "Evicted least recently used contextual arms"
        );
    }

    /// Confidence from observations beyond the prior
    fn compute_confidence(&self, global: &BetaParams, contextual: &BetaParams) -> f64 {
        let prior_total = self.prior_total();
        // One update touches both tiers, so take the max instead of the sum
        let effective = global
            .observations(prior_total)
            .max(contextual.observations(prior_total));

        (effective / (effective + self.confidence_scale)).clamp(0.0, 1.0)
    }
}

impl ExplorationPolicy for ContextualBanditModel {
    fn select_action(
        &mut self,
        actions: &[Action],
        context: &BanditContext,
    ) -> Result<ActionSelection, DecisionError> {
        ContextualBanditModel::select_action(self, actions, context)
    }
}

// ==================== Unit Tests ====================
