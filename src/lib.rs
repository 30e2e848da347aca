#![deny(clippy::all)]

pub mod coldstart;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod router;
pub mod sampling;
pub mod sanitize;
pub mod thompson;
pub mod types;

// 重新导出主要类型
pub use coldstart::{
    ColdStartClassifier, ColdStartFeedback, ColdStartSelection, ColdStartSnapshot,
    ExplorationPolicy, ProbeResult, SelectionSource, TypeDistribution,
};
pub use config::{
    BanditConfig, CircuitBreakerConfig, ColdStartConfig, DecisionConfig, RouterConfig,
};
pub use engine::{Decision, DecisionEngine, DecisionSource, UserDecisionSnapshot, UserDecisionState};
pub use error::{ConfigError, DecisionError, OpsError};
pub use router::{
    BanditOperation, CircuitBreaker, CircuitState, ExecutionRouter, RouteDecision, RouterStats,
    SmartRouter,
};
pub use sampling::{BanditOps, BanditRng, BetaParams, ParallelOps, ReferenceOps};
pub use thompson::{ActionSelection, BanditSnapshot, BatchUpdateItem, ContextualBanditModel};
pub use types::*;
