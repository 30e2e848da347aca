//! 冷启动状态快照
//!
//! 字段都以宽松类型保存，损坏的文档在恢复时逐字段修复而不是整体拒绝。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ProbeResult;
use crate::sanitize::{
    invalid_count, json_count as count, json_number as number, lenient_count, lenient_f64,
    missing_f64,
};
use crate::types::{Action, Difficulty};

fn text(value: Option<&Value>) -> String {
    value
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSnapshot {
    #[serde(default = "missing_f64", deserialize_with = "lenient_f64")]
    pub interval_scale: f64,
    #[serde(default = "missing_f64", deserialize_with = "lenient_f64")]
    pub new_ratio: f64,
    #[serde(default)]
    pub difficulty: String,
    #[serde(default = "invalid_count", deserialize_with = "lenient_count")]
    pub batch_size: i64,
    #[serde(default = "invalid_count", deserialize_with = "lenient_count")]
    pub hint_level: i64,
}

impl From<&Action> for ActionSnapshot {
    fn from(action: &Action) -> Self {
        Self {
            interval_scale: action.interval_scale,
            new_ratio: action.new_ratio,
            difficulty: action.difficulty.as_str().to_string(),
            batch_size: i64::from(action.batch_size),
            hint_level: i64::from(action.hint_level),
        }
    }
}

impl Default for ActionSnapshot {
    fn default() -> Self {
        Self::from(&Action::default())
    }
}

impl ActionSnapshot {
    pub fn from_value(value: &Value) -> Self {
        Self {
            interval_scale: number(value.get("intervalScale")),
            new_ratio: number(value.get("newRatio")),
            difficulty: text(value.get("difficulty")),
            batch_size: count(value.get("batchSize")),
            hint_level: count(value.get("hintLevel")),
        }
    }

    /// 非法字段替换为 stable 默认值，未知难度回退到 mid
    pub fn restore(&self) -> Action {
        let defaults = Action::default();
        let level = |raw: i64, d: i32| i32::try_from(raw).ok().filter(|v| *v >= 0).unwrap_or(d);

        Action {
            interval_scale: self.interval_scale,
            new_ratio: self.new_ratio,
            difficulty: Difficulty::from_name(&self.difficulty).unwrap_or_default(),
            batch_size: level(self.batch_size, defaults.batch_size),
            hint_level: level(self.hint_level, defaults.hint_level),
        }
        .sanitized()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResultSnapshot {
    #[serde(default)]
    pub action: ActionSnapshot,
    #[serde(default = "missing_f64", deserialize_with = "lenient_f64")]
    pub reward: f64,
    #[serde(default)]
    pub is_correct: bool,
    #[serde(default = "missing_f64", deserialize_with = "lenient_f64")]
    pub response_time_ms: f64,
    #[serde(default = "missing_f64", deserialize_with = "lenient_f64")]
    pub error_rate: f64,
    #[serde(default = "invalid_count", deserialize_with = "lenient_count")]
    pub timestamp_ms: i64,
}

impl From<&ProbeResult> for ProbeResultSnapshot {
    fn from(result: &ProbeResult) -> Self {
        Self {
            action: ActionSnapshot::from(&result.action),
            reward: result.reward,
            is_correct: result.is_correct,
            response_time_ms: result.response_time_ms,
            error_rate: result.error_rate,
            timestamp_ms: result.timestamp_ms,
        }
    }
}

impl ProbeResultSnapshot {
    pub fn from_value(value: &Value) -> Self {
        Self {
            action: value
                .get("action")
                .map(ActionSnapshot::from_value)
                .unwrap_or_default(),
            reward: number(value.get("reward")),
            is_correct: value
                .get("isCorrect")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            response_time_ms: number(value.get("responseTimeMs")),
            error_rate: number(value.get("errorRate")),
            timestamp_ms: count(value.get("timestampMs")),
        }
    }

    pub fn restore(&self) -> ProbeResult {
        ProbeResult::sanitized(
            &self.action.restore(),
            self.reward,
            self.is_correct,
            self.response_time_ms,
            self.error_rate,
            self.timestamp_ms,
        )
    }
}

/// JSON document exchanged with the external store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColdStartSnapshot {
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub user_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub probe_index: i64,
    #[serde(default)]
    pub results: Vec<ProbeResultSnapshot>,
    #[serde(default)]
    pub settled_strategy: Option<ActionSnapshot>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub update_count: i64,
}

impl ColdStartSnapshot {
    /// 任意 JSON 都能解析；类型不符的字段按缺失处理
    pub fn from_value(value: &Value) -> Self {
        Self {
            phase: text(value.get("phase")),
            user_type: value
                .get("userType")
                .and_then(Value::as_str)
                .map(str::to_string),
            probe_index: count(value.get("probeIndex")),
            results: value
                .get("results")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter(|item| item.is_object())
                        .map(ProbeResultSnapshot::from_value)
                        .collect()
                })
                .unwrap_or_default(),
            settled_strategy: value
                .get("settledStrategy")
                .filter(|v| v.is_object())
                .map(ActionSnapshot::from_value),
            update_count: count(value.get("updateCount")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coldstart::{ColdStartClassifier, ColdStartFeedback, DEFAULT_PROBE_ERROR_RATE};
    use crate::types::{ColdStartPhase, UserType};
    use serde_json::json;

    #[test]
    fn test_state_round_trip() {
        let mut c1 = ColdStartClassifier::default();
        for _ in 0..3 {
            c1.update(
                &Action::for_user_type(UserType::Cautious),
                &ColdStartFeedback::new(0.0, false, 5_000.0, 0.8).at(42),
            );
        }
        let json = serde_json::to_string(&c1.get_state()).unwrap();
        let snapshot: ColdStartSnapshot = serde_json::from_str(&json).unwrap();

        let mut c2 = ColdStartClassifier::default();
        c2.set_state(&snapshot);
        assert_eq!(c2.phase(), c1.phase());
        assert_eq!(c2.user_type(), c1.user_type());
        assert_eq!(c2.settled_strategy(), c1.settled_strategy());
        assert_eq!(c2.update_count(), c1.update_count());
        assert_eq!(c2.posterior(), c1.posterior());
        assert_eq!(c2.get_state(), c1.get_state());
    }

    #[test]
    fn test_corrupt_snapshot_is_repaired() {
        let doc = json!({
            "phase": "warmup",
            "userType": "reckless",
            "probeIndex": -4,
            "updateCount": null,
            "results": [{
                "action": { "intervalScale": -1.0, "newRatio": null, "difficulty": "insane", "batchSize": -2, "hintLevel": 3 },
                "reward": null,
                "isCorrect": true,
                "responseTimeMs": 999999,
                "errorRate": null,
                "timestampMs": -10
            }],
            "settledStrategy": { "intervalScale": 1.4, "newRatio": 0.25, "difficulty": "hard", "batchSize": 10.0, "hintLevel": null }
        });
        let snapshot: ColdStartSnapshot = serde_json::from_value(doc).unwrap();
        let mut c = ColdStartClassifier::default();
        c.set_state(&snapshot);

        assert_eq!(c.phase(), ColdStartPhase::Classify);
        assert_eq!(c.user_type(), None);
        assert_eq!(c.probe_index(), 0);
        assert_eq!(c.update_count(), 0);

        let probe = c.results().next().unwrap();
        assert_eq!(probe.reward, 0.0);
        assert_eq!(probe.response_time_ms, 60_000.0);
        assert_eq!(probe.error_rate, DEFAULT_PROBE_ERROR_RATE);
        assert_eq!(probe.timestamp_ms, 0);
        assert_eq!(probe.action.interval_scale, 1.0);
        assert_eq!(probe.action.new_ratio, 0.2);
        assert_eq!(probe.action.difficulty, Difficulty::Mid);
        assert_eq!(probe.action.batch_size, 8);
        assert_eq!(probe.action.hint_level, 3);

        let settled = c.settled_strategy().unwrap();
        assert_eq!(settled.difficulty, Difficulty::Hard);
        assert_eq!(settled.batch_size, 10);
        assert_eq!(settled.hint_level, 1);
        assert!((c.posterior().sum() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_from_value_tolerates_type_drift() {
        let doc = json!({
            "phase": 2,
            "userType": "fast",
            "probeIndex": "three",
            "results": [42, { "reward": 0.9, "responseTimeMs": 1200, "errorRate": 0.1, "timestampMs": 7 }],
            "settledStrategy": "fast",
            "updateCount": 5.0
        });
        let snapshot = ColdStartSnapshot::from_value(&doc);
        assert_eq!(snapshot.results.len(), 1);
        assert!(snapshot.settled_strategy.is_none());
        assert_eq!(snapshot.update_count, 5);

        let mut c = ColdStartClassifier::default();
        c.set_state(&snapshot);
        assert_eq!(c.phase(), ColdStartPhase::Classify);
        assert_eq!(c.user_type(), Some(UserType::Fast));
        assert_eq!(c.probe_index(), 0);
        assert_eq!(c.results().next().unwrap().action, Action::default());
        assert!(c.posterior().fast > c.posterior().cautious);

        // 完全无关的值也能得到初始状态
        c.set_state(&ColdStartSnapshot::from_value(&json!([1, 2, 3])));
        assert_eq!(c.phase(), ColdStartPhase::Classify);
        assert_eq!(c.results().len(), 0);
    }

    #[test]
    fn test_results_truncated_to_newest() {
        let item = |ts: i64| {
            json!({ "action": {}, "reward": 0.5, "responseTimeMs": 2000, "errorRate": 0.2, "timestampMs": ts })
        };
        let results: Vec<Value> = (0..30).map(item).collect();
        let snapshot = ColdStartSnapshot::from_value(&json!({ "phase": "explore", "results": results }));

        let mut c = ColdStartClassifier::default();
        c.set_state(&snapshot);
        assert_eq!(c.phase(), ColdStartPhase::Explore);
        assert_eq!(c.results().len(), 20);
        assert_eq!(c.results().next().unwrap().timestamp_ms, 10);
    }
}
