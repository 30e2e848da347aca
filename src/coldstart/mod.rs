//! 冷启动分类器
//!
//! classify: 固定探针序列 + 贝叶斯后验 (fast / stable / cautious)
//! explore: 委托给 `ExplorationPolicy` (通常是 Thompson bandit)
//! normal: 返回已确定的策略

mod snapshot;

pub use snapshot::{ActionSnapshot, ColdStartSnapshot, ProbeResultSnapshot};

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::ColdStartConfig;
use crate::error::DecisionError;
use crate::sanitize::{clamp_reward, finite_or, sanitize_unit};
use crate::thompson::ActionSelection;
use crate::types::{Action, BanditContext, ColdStartPhase, UserType};

pub const MIN_PROBE_RESPONSE_TIME_MS: f64 = 100.0;
pub const MAX_PROBE_RESPONSE_TIME_MS: f64 = 60_000.0;
pub const DEFAULT_PROBE_RESPONSE_TIME_MS: f64 = 3_000.0;
pub const DEFAULT_PROBE_ERROR_RATE: f64 = 0.5;

/// 全局先验的下限，避免某类后验被永久锁死为 0
const MIN_PRIOR: f64 = 1e-6;

/// explore 阶段的动作来源
pub trait ExplorationPolicy {
    fn select_action(
        &mut self,
        actions: &[Action],
        context: &BanditContext,
    ) -> Result<ActionSelection, DecisionError>;
}

// ==================== Likelihood Model ====================

/// 单个用户类型的高斯似然参数
#[derive(Debug, Clone, Copy)]
struct Hypothesis {
    reward_mean: f64,
    response_time_mean_s: f64,
    error_rate_mean: f64,
}

const REWARD_SIGMA: f64 = 0.3;
const RESPONSE_TIME_SIGMA_S: f64 = 1.5;
const ERROR_RATE_SIGMA: f64 = 0.2;

// 顺序与 UserType::index 一致
const HYPOTHESES: [Hypothesis; 3] = [
    // fast: 高奖励、低延迟、低错误率
    Hypothesis {
        reward_mean: 0.9,
        response_time_mean_s: 1.5,
        error_rate_mean: 0.1,
    },
    // stable
    Hypothesis {
        reward_mean: 0.6,
        response_time_mean_s: 3.0,
        error_rate_mean: 0.3,
    },
    // cautious
    Hypothesis {
        reward_mean: 0.2,
        response_time_mean_s: 5.0,
        error_rate_mean: 0.6,
    },
];

impl Hypothesis {
    /// 对数似然 (省略各假设共享的常数项)
    fn log_likelihood(&self, probe: &ProbeResult) -> f64 {
        let z = |x: f64, mean: f64, sigma: f64| {
            let d = (x - mean) / sigma;
            -0.5 * d * d
        };
        z(probe.reward, self.reward_mean, REWARD_SIGMA)
            + z(
                probe.response_time_ms / 1000.0,
                self.response_time_mean_s,
                RESPONSE_TIME_SIGMA_S,
            )
            + z(probe.error_rate, self.error_rate_mean, ERROR_RATE_SIGMA)
    }
}

/// Probability mass over the three user types.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeDistribution {
    pub fast: f64,
    pub stable: f64,
    pub cautious: f64,
}

impl Default for TypeDistribution {
    fn default() -> Self {
        Self::uniform()
    }
}

impl TypeDistribution {
    pub fn uniform() -> Self {
        Self::from_array([1.0 / 3.0; 3])
    }

    pub fn from_array(values: [f64; 3]) -> Self {
        Self {
            fast: values[0],
            stable: values[1],
            cautious: values[2],
        }
    }

    pub fn as_array(&self) -> [f64; 3] {
        [self.fast, self.stable, self.cautious]
    }

    pub fn get(&self, user_type: UserType) -> f64 {
        self.as_array()[user_type.index()]
    }

    /// 最大概率的类型；相等时取靠前者
    pub fn argmax(&self) -> (UserType, f64) {
        let values = self.as_array();
        let mut best = 0;
        for (i, value) in values.iter().enumerate().skip(1) {
            if *value > values[best] {
                best = i;
            }
        }
        (UserType::from_index(best), values[best])
    }

    pub fn sum(&self) -> f64 {
        self.as_array().iter().sum()
    }
}

// ==================== Probe Data ====================

/// Outcome reported for one served action.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColdStartFeedback {
    pub reward: f64,
    pub is_correct: bool,
    pub response_time_ms: f64,
    pub error_rate: f64,
    /// 缺省时使用当前时间
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
}

impl ColdStartFeedback {
    pub fn new(reward: f64, is_correct: bool, response_time_ms: f64, error_rate: f64) -> Self {
        Self {
            reward,
            is_correct,
            response_time_ms,
            error_rate,
            timestamp_ms: None,
        }
    }

    pub fn at(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub action: Action,
    pub reward: f64,
    pub is_correct: bool,
    pub response_time_ms: f64,
    pub error_rate: f64,
    pub timestamp_ms: i64,
}

impl ProbeResult {
    /// 构造时清洗所有字段，不保存原始值
    pub fn sanitized(
        action: &Action,
        reward: f64,
        is_correct: bool,
        response_time_ms: f64,
        error_rate: f64,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            action: action.sanitized(),
            reward: clamp_reward(reward),
            is_correct,
            response_time_ms: finite_or(response_time_ms, DEFAULT_PROBE_RESPONSE_TIME_MS)
                .clamp(MIN_PROBE_RESPONSE_TIME_MS, MAX_PROBE_RESPONSE_TIME_MS),
            error_rate: sanitize_unit(error_rate, DEFAULT_PROBE_ERROR_RATE),
            timestamp_ms: timestamp_ms.max(0),
        }
    }

    pub fn from_feedback(action: &Action, feedback: &ColdStartFeedback) -> Self {
        let timestamp = feedback
            .timestamp_ms
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        Self::sanitized(
            action,
            feedback.reward,
            feedback.is_correct,
            feedback.response_time_ms,
            feedback.error_rate,
            timestamp,
        )
    }
}

// ==================== Selection ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionSource {
    Probe,
    Explore,
    Settled,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColdStartSelection {
    pub action: Action,
    pub source: SelectionSource,
    pub phase: ColdStartPhase,
    /// classify/normal: 最大后验；explore: bandit 置信度
    pub confidence: f64,
}

// ==================== Classifier ====================

#[derive(Debug, Clone)]
pub struct ColdStartClassifier {
    config: ColdStartConfig,
    phase: ColdStartPhase,
    user_type: Option<UserType>,
    probe_index: usize,
    results: VecDeque<ProbeResult>,
    settled_strategy: Option<Action>,
    update_count: u64,
    posterior: TypeDistribution,
    global_priors: Option<TypeDistribution>,
}

impl Default for ColdStartClassifier {
    fn default() -> Self {
        Self::new(ColdStartConfig::default())
    }
}

impl ColdStartClassifier {
    pub fn new(config: ColdStartConfig) -> Self {
        let mut config = config;
        if config.probe_sequence.is_empty() {
            config.probe_sequence = ColdStartConfig::default().probe_sequence;
        }
        config.max_results = config.max_results.max(1);

        Self {
            config,
            phase: ColdStartPhase::Classify,
            user_type: None,
            probe_index: 0,
            results: VecDeque::new(),
            settled_strategy: None,
            update_count: 0,
            posterior: TypeDistribution::uniform(),
            global_priors: None,
        }
    }

    pub fn config(&self) -> &ColdStartConfig {
        &self.config
    }

    pub fn select_action(
        &mut self,
        actions: &[Action],
        context: &BanditContext,
        explorer: &mut dyn ExplorationPolicy,
        default: &Action,
    ) -> Result<ColdStartSelection, DecisionError> {
        match self.phase {
            ColdStartPhase::Classify => {
                let user_type = self
                    .config
                    .probe_sequence
                    .get(self.probe_index)
                    .copied()
                    .unwrap_or_else(|| self.posterior.argmax().0);
                Ok(ColdStartSelection {
                    action: Action::for_user_type(user_type),
                    source: SelectionSource::Probe,
                    phase: self.phase,
                    confidence: self.posterior.argmax().1,
                })
            }
            ColdStartPhase::Explore => {
                let selection = explorer.select_action(actions, context)?;
                Ok(ColdStartSelection {
                    action: selection.action,
                    source: SelectionSource::Explore,
                    phase: self.phase,
                    confidence: selection.confidence,
                })
            }
            ColdStartPhase::Normal => {
                let (action, source) = match &self.settled_strategy {
                    Some(settled) => (settled.clone(), SelectionSource::Settled),
                    None => (default.clone(), SelectionSource::Default),
                };
                Ok(ColdStartSelection {
                    action,
                    source,
                    phase: self.phase,
                    confidence: self.posterior.argmax().1,
                })
            }
        }
    }

    /// 记录一次反馈，返回更新后的阶段
    pub fn update(&mut self, action: &Action, feedback: &ColdStartFeedback) -> ColdStartPhase {
        self.update_count += 1;

        match self.phase {
            ColdStartPhase::Classify => self.handle_classify(action, feedback),
            ColdStartPhase::Explore => {
                if self.update_count >= u64::from(self.config.explore_threshold) {
                    self.transition(ColdStartPhase::Normal);
                }
            }
            ColdStartPhase::Normal => {}
        }

        self.phase
    }

    fn handle_classify(&mut self, action: &Action, feedback: &ColdStartFeedback) {
        self.push_result(ProbeResult::from_feedback(action, feedback));
        self.probe_index += 1;
        self.recompute_posterior();

        let (user_type, confidence) = self.posterior.argmax();

        // 证据足够时提前结束分类，跳过剩余探针
        if self.probe_index >= self.config.min_classify_probes
            && confidence > self.config.confidence_threshold
        {
            tracing::debug!(
                user_type = user_type.as_str(),
                confidence,
                probes = self.probe_index,
                "Cold start classified early"
            );
            self.settle(user_type);
            return;
        }

        if self.probe_index >= self.config.probe_sequence.len() {
            tracing::debug!(
                user_type = user_type.as_str(),
                confidence,
                probes = self.probe_index,
                "Cold start probe sequence finished"
            );
            self.settle(user_type);
        }
    }

    fn settle(&mut self, user_type: UserType) {
        self.user_type = Some(user_type);
        self.settled_strategy = Some(Action::for_user_type(user_type));
        self.transition(ColdStartPhase::Explore);
    }

    fn transition(&mut self, next: ColdStartPhase) {
        tracing::debug!(
            from = self.phase.as_str(),
            to = next.as_str(),
            update_count = self.update_count,
            "Cold start phase transition"
        );
        self.phase = next;
    }

    fn push_result(&mut self, result: ProbeResult) {
        while self.results.len() >= self.config.max_results {
            self.results.pop_front();
        }
        self.results.push_back(result);
    }

    fn prior(&self) -> [f64; 3] {
        match &self.global_priors {
            Some(priors) => {
                let floored = priors.as_array().map(|p| p.max(MIN_PRIOR));
                let total: f64 = floored.iter().sum();
                floored.map(|p| p / total)
            }
            None => TypeDistribution::uniform().as_array(),
        }
    }

    /// 对数空间累加证据，log-sum-exp 归一化
    fn recompute_posterior(&mut self) {
        let prior = self.prior();
        let mut log_post = [0.0; 3];
        for (i, hypothesis) in HYPOTHESES.iter().enumerate() {
            log_post[i] = prior[i].ln()
                + self
                    .results
                    .iter()
                    .map(|r| hypothesis.log_likelihood(r))
                    .sum::<f64>();
        }

        let max = log_post.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            self.posterior = TypeDistribution::from_array(prior);
            return;
        }
        let exp = log_post.map(|l| (l - max).exp());
        let total: f64 = exp.iter().sum();
        self.posterior = TypeDistribution::from_array(exp.map(|e| e / total));
    }

    /// 用群体统计替换均匀先验；全零输入忽略
    pub fn set_global_priors(&mut self, priors: TypeDistribution) {
        let cleaned = priors
            .as_array()
            .map(|p| if p.is_finite() && p > 0.0 { p } else { 0.0 });
        let total: f64 = cleaned.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            tracing::debug!("Ignoring empty cold start global priors");
            return;
        }

        self.global_priors = Some(TypeDistribution::from_array(cleaned.map(|p| p / total)));
        self.recompute_posterior();
    }

    pub fn has_global_priors(&self) -> bool {
        self.global_priors.is_some()
    }

    pub fn global_priors(&self) -> Option<TypeDistribution> {
        self.global_priors
    }

    pub fn get_progress(&self) -> f64 {
        match self.phase {
            ColdStartPhase::Classify => 0.0,
            ColdStartPhase::Explore => 0.5,
            ColdStartPhase::Normal => 1.0,
        }
    }

    /// 回到 classify，保留全局先验
    pub fn reset(&mut self) {
        self.phase = ColdStartPhase::Classify;
        self.user_type = None;
        self.probe_index = 0;
        self.results.clear();
        self.settled_strategy = None;
        self.update_count = 0;
        self.recompute_posterior();
    }

    pub fn posterior(&self) -> TypeDistribution {
        self.posterior
    }

    pub fn phase(&self) -> ColdStartPhase {
        self.phase
    }

    pub fn user_type(&self) -> Option<UserType> {
        self.user_type
    }

    pub fn settled_strategy(&self) -> Option<&Action> {
        self.settled_strategy.as_ref()
    }

    pub fn results(&self) -> impl ExactSizeIterator<Item = &ProbeResult> {
        self.results.iter()
    }

    pub fn probe_index(&self) -> usize {
        self.probe_index
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.phase, ColdStartPhase::Normal)
    }

    pub fn get_state(&self) -> ColdStartSnapshot {
        ColdStartSnapshot {
            phase: self.phase.as_str().to_string(),
            user_type: self.user_type.map(|t| t.as_str().to_string()),
            probe_index: i64::try_from(self.probe_index).unwrap_or(i64::MAX),
            results: self.results.iter().map(ProbeResultSnapshot::from).collect(),
            settled_strategy: self.settled_strategy.as_ref().map(ActionSnapshot::from),
            update_count: i64::try_from(self.update_count).unwrap_or(i64::MAX),
        }
    }

    /// 逐字段修复，不会失败
    pub fn set_state(&mut self, snapshot: &ColdStartSnapshot) {
        self.phase = ColdStartPhase::from_name(&snapshot.phase).unwrap_or_default();
        self.user_type = snapshot.user_type.as_deref().and_then(UserType::from_name);
        self.probe_index = usize::try_from(snapshot.probe_index).unwrap_or(0);
        self.update_count = u64::try_from(snapshot.update_count).unwrap_or(0);
        self.settled_strategy = snapshot.settled_strategy.as_ref().map(ActionSnapshot::restore);

        let skip = snapshot.results.len().saturating_sub(self.config.max_results);
        self.results = snapshot
            .results
            .iter()
            .skip(skip)
            .map(ProbeResultSnapshot::restore)
            .collect();

        self.recompute_posterior();
    }
}

// ==================== Unit Tests ====================
