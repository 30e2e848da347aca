use serde::{Deserialize, Serialize};

use crate::sanitize::{finite_or, sanitize_unit};

// 上下文分桶步长
pub const ERROR_RATE_STEP: f64 = 0.05;
pub const RESPONSE_TIME_STEP_MS: f64 = 500.0;
pub const SIGNAL_STEP: f64 = 0.1;

pub const MIN_CONTEXT_RESPONSE_TIME_MS: f64 = 50.0;
pub const MAX_CONTEXT_RESPONSE_TIME_MS: f64 = 10_000.0;
pub const DEFAULT_CONTEXT_RESPONSE_TIME_MS: f64 = 3_000.0;
pub const MAX_TIME_BUCKET: u8 = 23;

/// Action 键中浮点字段的量化精度 (保留两位小数)
const KEY_SCALE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum Difficulty {
    Easy,
    #[default]
    Mid,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Easy => "easy",
            Self::Mid => "mid",
            Self::Hard => "hard",
        }
    }

    /// Strict parse: unknown names are rejected instead of mapped.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "easy" => Some(Self::Easy),
            "mid" => Some(Self::Mid),
            "hard" => Some(Self::Hard),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Fast,
    Stable,
    Cautious,
}

impl UserType {
    pub const ALL: [UserType; 3] = [UserType::Fast, UserType::Stable, UserType::Cautious];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Stable => "stable",
            Self::Cautious => "cautious",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "fast" => Some(Self::Fast),
            "stable" => Some(Self::Stable),
            "cautious" => Some(Self::Cautious),
            _ => None,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::Fast => 0,
            Self::Stable => 1,
            Self::Cautious => 2,
        }
    }

    pub fn from_index(idx: usize) -> Self {
        match idx {
            0 => Self::Fast,
            2 => Self::Cautious,
            _ => Self::Stable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum ColdStartPhase {
    #[default]
    Classify,
    Explore,
    Normal,
}

impl ColdStartPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::Explore => "explore",
            Self::Normal => "normal",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "classify" => Some(Self::Classify),
            "explore" => Some(Self::Explore),
            "normal" => Some(Self::Normal),
            _ => None,
        }
    }
}

/// Learning strategy chosen by the decision core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub interval_scale: f64,
    pub new_ratio: f64,
    pub difficulty: Difficulty,
    pub batch_size: i32,
    pub hint_level: i32,
}

impl Default for Action {
    fn default() -> Self {
        Self {
            interval_scale: 1.0,
            new_ratio: 0.2,
            difficulty: Difficulty::Mid,
            batch_size: 8,
            hint_level: 1,
        }
    }
}

impl Action {
    pub fn for_user_type(user_type: UserType) -> Self {
        match user_type {
            UserType::Fast => Self {
                interval_scale: 0.8,
                new_ratio: 0.3,
                difficulty: Difficulty::Hard,
                batch_size: 12,
                hint_level: 0,
            },
            UserType::Stable => Self::default(),
            UserType::Cautious => Self {
                interval_scale: 1.2,
                new_ratio: 0.1,
                difficulty: Difficulty::Easy,
                batch_size: 5,
                hint_level: 2,
            },
        }
    }

    pub fn key(&self) -> ActionKey {
        ActionKey::from(self)
    }

    /// Replaces non-finite or negative fields with the stable defaults.
    pub fn sanitized(&self) -> Self {
        let defaults = Self::default();
        let non_negative = |v: f64, d: f64| if v.is_finite() && v >= 0.0 { v } else { d };
        Self {
            interval_scale: non_negative(self.interval_scale, defaults.interval_scale),
            new_ratio: non_negative(self.new_ratio, defaults.new_ratio),
            difficulty: self.difficulty,
            batch_size: if self.batch_size >= 0 {
                self.batch_size
            } else {
                defaults.batch_size
            },
            hint_level: if self.hint_level >= 0 {
                self.hint_level
            } else {
                defaults.hint_level
            },
        }
    }
}

/// Canonical map key of an [`Action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionKey {
    pub interval_scale: i64,
    pub new_ratio: i64,
    pub difficulty: Difficulty,
    pub batch_size: i32,
    pub hint_level: i32,
}

fn quantize(value: f64) -> i64 {
    if value.is_finite() {
        (value * KEY_SCALE).round() as i64
    } else {
        0
    }
}

impl From<&Action> for ActionKey {
    fn from(action: &Action) -> Self {
        Self {
            interval_scale: quantize(action.interval_scale),
            new_ratio: quantize(action.new_ratio),
            difficulty: action.difficulty,
            batch_size: action.batch_size,
            hint_level: action.hint_level,
        }
    }
}

/// Caller supplied user-state signals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSignals {
    /// A, [0, 1]
    pub attention: f64,
    /// F, [0, 1]
    pub fatigue: f64,
    /// M, [-1, 1]
    pub motivation: f64,
}

impl Default for UserSignals {
    fn default() -> Self {
        Self {
            attention: 0.5,
            fatigue: 0.0,
            motivation: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanditContext {
    pub recent_error_rate: f64,
    pub recent_response_time_ms: f64,
    pub time_bucket: u8,
    #[serde(default)]
    pub signals: UserSignals,
}

impl Default for BanditContext {
    fn default() -> Self {
        Self {
            recent_error_rate: 0.0,
            recent_response_time_ms: DEFAULT_CONTEXT_RESPONSE_TIME_MS,
            time_bucket: 0,
            signals: UserSignals::default(),
        }
    }
}

impl BanditContext {
    pub fn new(recent_error_rate: f64, recent_response_time_ms: f64, time_bucket: u8) -> Self {
        Self {
            recent_error_rate,
            recent_response_time_ms,
            time_bucket,
            signals: UserSignals::default(),
        }
    }

    pub fn with_signals(mut self, signals: UserSignals) -> Self {
        self.signals = signals;
        self
    }

    /// Clamped copy; non-finite fields fall back to neutral defaults.
    pub fn sanitized(&self) -> Self {
        let defaults = UserSignals::default();
        Self {
            recent_error_rate: sanitize_unit(self.recent_error_rate, 0.0),
            recent_response_time_ms: finite_or(
                self.recent_response_time_ms,
                DEFAULT_CONTEXT_RESPONSE_TIME_MS,
            )
            .clamp(MIN_CONTEXT_RESPONSE_TIME_MS, MAX_CONTEXT_RESPONSE_TIME_MS),
            time_bucket: self.time_bucket.min(MAX_TIME_BUCKET),
            signals: UserSignals {
                attention: sanitize_unit(self.signals.attention, defaults.attention),
                fatigue: sanitize_unit(self.signals.fatigue, defaults.fatigue),
                motivation: finite_or(self.signals.motivation, defaults.motivation)
                    .clamp(-1.0, 1.0),
            },
        }
    }

    pub fn key(&self) -> ContextKey {
        ContextKey::from(self)
    }
}

/// Bucketized context, bounds the number of contextual arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextKey {
    pub error_rate: u8,
    pub response_time: u8,
    pub time_bucket: u8,
    pub attention: u8,
    pub fatigue: u8,
    pub motivation: u8,
}

fn bucket(value: f64, lower: f64, upper: f64, step: f64) -> u8 {
    let max_index = ((upper / step) + 1e-9).floor();
    let idx = ((value.clamp(lower, upper) / step) + 1e-9).floor();
    idx.clamp(0.0, max_index) as u8
}

impl From<&BanditContext> for ContextKey {
    fn from(context: &BanditContext) -> Self {
        let ctx = context.sanitized();
        Self {
            error_rate: bucket(ctx.recent_error_rate, 0.0, 1.0, ERROR_RATE_STEP),
            response_time: bucket(
                ctx.recent_response_time_ms,
                MIN_CONTEXT_RESPONSE_TIME_MS,
                MAX_CONTEXT_RESPONSE_TIME_MS,
                RESPONSE_TIME_STEP_MS,
            ),
            time_bucket: ctx.time_bucket,
            attention: bucket(ctx.signals.attention, 0.0, 1.0, SIGNAL_STEP),
            fatigue: bucket(ctx.signals.fatigue, 0.0, 1.0, SIGNAL_STEP),
            motivation: bucket((ctx.signals.motivation + 1.0) / 2.0, 0.0, 1.0, SIGNAL_STEP),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_actions_share_a_key() {
        let a = Action::for_user_type(UserType::Fast);
        let b = Action { ..a.clone() };
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), Action::default().key());
    }

    #[test]
    fn context_buckets_use_fixed_steps() {
        let ctx = BanditContext::new(0.12, 1_250.0, 9).with_signals(UserSignals {
            attention: 0.35,
            fatigue: 1.0,
            motivation: -1.0,
        });
        let key = ctx.key();
        assert_eq!(key.error_rate, 2);
        assert_eq!(key.response_time, 2);
        assert_eq!(key.time_bucket, 9);
        assert_eq!(key.attention, 3);
        assert_eq!(key.fatigue, 10);
        assert_eq!(key.motivation, 0);
    }

    #[test]
    fn context_key_sanitizes_garbage() {
        let ctx = BanditContext::new(f64::NAN, f64::INFINITY, 99);
        let key = ctx.key();
        assert_eq!(key.error_rate, 0);
        assert_eq!(key.response_time, 6);
        assert_eq!(key.time_bucket, MAX_TIME_BUCKET);
        assert_eq!(key, BanditContext::new(0.0, 3_000.0, 23).key());
    }

    #[test]
    fn nearby_contexts_collapse_into_one_bucket() {
        let a = BanditContext::new(0.101, 2_010.0, 3);
        let b = BanditContext::new(0.149, 2_490.0, 3);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn sanitized_action_repairs_fields() {
        let broken = Action {
            interval_scale: f64::NAN,
            new_ratio: -0.5,
            difficulty: Difficulty::Hard,
            batch_size: -3,
            hint_level: 2,
        };
        let fixed = broken.sanitized();
        assert_eq!(fixed.interval_scale, 1.0);
        assert_eq!(fixed.new_ratio, 0.2);
        assert_eq!(fixed.difficulty, Difficulty::Hard);
        assert_eq!(fixed.batch_size, 8);
        assert_eq!(fixed.hint_level, 2);
    }

    #[test]
    fn enum_names_round_trip() {
        for t in UserType::ALL {
            assert_eq!(UserType::from_name(t.as_str()), Some(t));
        }
        assert_eq!(Difficulty::from_name("HARD"), Some(Difficulty::Hard));
        assert_eq!(Difficulty::from_name("impossible"), None);
        assert_eq!(ColdStartPhase::from_name("warmup"), None);
    }
}
