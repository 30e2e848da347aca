//! 决策核心入口
//!
//! `DecisionEngine` 在进程内只构造一次，持有共享的 `ExecutionRouter`
//! (含熔断器)；每个用户各有一个 `UserDecisionState`，由调用方串行访问。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coldstart::{
    ColdStartClassifier, ColdStartFeedback, ColdStartSelection, ColdStartSnapshot,
    SelectionSource,
};
use crate::config::DecisionConfig;
use crate::error::DecisionError;
use crate::router::ExecutionRouter;
use crate::sampling::BanditOps;
use crate::thompson::{BanditSnapshot, ContextualBanditModel};
use crate::types::{Action, BanditContext, ColdStartPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    Probe,
    Explore,
    Settled,
    Default,
    Bandit,
}

impl From<SelectionSource> for DecisionSource {
    fn from(source: SelectionSource) -> Self {
        match source {
            SelectionSource::Probe => Self::Probe,
            SelectionSource::Explore => Self::Explore,
            SelectionSource::Settled => Self::Settled,
            SelectionSource::Default => Self::Default,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub action: Action,
    pub source: DecisionSource,
    pub phase: ColdStartPhase,
    pub confidence: f64,
}

impl From<ColdStartSelection> for Decision {
    fn from(selection: ColdStartSelection) -> Self {
        Self {
            action: selection.action,
            source: selection.source.into(),
            phase: selection.phase,
            confidence: selection.confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDecisionSnapshot {
    #[serde(default)]
    pub cold_start: ColdStartSnapshot,
    #[serde(default)]
    pub bandit: BanditSnapshot,
}

impl UserDecisionSnapshot {
    /// 宽松解析：逐字段修复，只丢弃无法读取的条目
    pub fn from_value(value: &Value) -> Self {
        let cold_start = value
            .get("coldStart")
            .map(ColdStartSnapshot::from_value)
            .unwrap_or_default();

        let bandit = value
            .get("bandit")
            .map(BanditSnapshot::from_value)
            .unwrap_or_default();

        Self { cold_start, bandit }
    }
}

pub struct DecisionEngine {
    config: DecisionConfig,
    router: Arc<ExecutionRouter>,
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("config", &self.config)
            .field("router", &self.router)
            .finish()
    }
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig) -> Result<Self, DecisionError> {
        config.validate()?;
        let router = Arc::new(ExecutionRouter::from_config(&config));
        Ok(Self { config, router })
    }

    pub fn with_accelerated(
        config: DecisionConfig,
        ops: Arc<dyn BanditOps>,
    ) -> Result<Self, DecisionError> {
        config.validate()?;
        let router = Arc::new(ExecutionRouter::from_config(&config).with_accelerated(ops));
        tracing::info!(
            accelerated = router.stats().accelerated.as_deref().unwrap_or("none"),
            "Decision engine initialized"
        );
        Ok(Self { config, router })
    }

    pub fn from_env() -> Result<Self, DecisionError> {
        Self::new(DecisionConfig::from_env())
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<ExecutionRouter> {
        &self.router
    }

    pub fn create_user_state(&self) -> UserDecisionState {
        UserDecisionState {
            cold_start: ColdStartClassifier::new(self.config.cold_start.clone()),
            bandit: ContextualBanditModel::with_config(&self.config.bandit, Arc::clone(&self.router)),
        }
    }

    pub fn create_user_state_with_seed(&self, seed: u64) -> UserDecisionState {
        let mut state = self.create_user_state();
        state.bandit.set_seed(seed);
        state
    }

    pub fn restore_user_state(&self, snapshot: &UserDecisionSnapshot) -> UserDecisionState {
        let mut state = self.create_user_state();
        state.cold_start.set_state(&snapshot.cold_start);
        state.bandit.set_state(&snapshot.bandit);
        state
    }
}

/// Cold start and bandit state of one user.
#[derive(Debug)]
pub struct UserDecisionState {
    cold_start: ColdStartClassifier,
    bandit: ContextualBanditModel,
}

impl UserDecisionState {
    /// 冷启动完成后直接由 bandit 选择
    pub fn select_action(
        &mut self,
        actions: &[Action],
        context: &BanditContext,
    ) -> Result<Decision, DecisionError> {
        if self.cold_start.is_complete() {
            let selection = self.bandit.select_action(actions, context)?;
            return Ok(Decision {
                action: selection.action,
                source: DecisionSource::Bandit,
                phase: ColdStartPhase::Normal,
                confidence: selection.confidence,
            });
        }

        let default = actions.first().cloned().unwrap_or_default();
        let selection =
            self.cold_start
                .select_action(actions, context, &mut self.bandit, &default)?;
        Ok(selection.into())
    }

    /// 反馈同时进入 bandit 与冷启动分类器
    pub fn update(
        &mut self,
        action: &Action,
        context: &BanditContext,
        feedback: &ColdStartFeedback,
    ) -> ColdStartPhase {
        self.bandit.update(action, context, feedback.reward);
        self.cold_start.update(action, feedback)
    }

    pub fn snapshot(&self) -> UserDecisionSnapshot {
        UserDecisionSnapshot {
            cold_start: self.cold_start.get_state(),
            bandit: self.bandit.get_state(),
        }
    }

    pub fn reset(&mut self) {
        self.cold_start.reset();
        self.bandit.reset();
    }

    pub fn cold_start(&self) -> &ColdStartClassifier {
        &self.cold_start
    }

    pub fn cold_start_mut(&mut self) -> &mut ColdStartClassifier {
        &mut self.cold_start
    }

    pub fn bandit(&self) -> &ContextualBanditModel {
        &self.bandit
    }

    pub fn bandit_mut(&mut self) -> &mut ContextualBanditModel {
        &mut self.bandit
    }
}
