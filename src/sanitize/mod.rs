//! 数值清洗：所有进入采样数学或持久化快照的数值都先经过这里

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// 数值稳定性：最小正数
pub const EPSILON: f64 = 1e-10;

/// 非有限值替换为默认值
#[inline]
pub fn finite_or(value: f64, default: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        default
    }
}

/// 限制到 [0, 1]，非有限值使用默认值
#[inline]
pub fn sanitize_unit(value: f64, default: f64) -> f64 {
    finite_or(value, default).clamp(0.0, 1.0)
}

/// 奖励限制到 [-1, 1]，NaN 视为中性奖励 0
#[inline]
pub fn clamp_reward(reward: f64) -> f64 {
    if reward.is_nan() {
        0.0
    } else {
        reward.clamp(-1.0, 1.0)
    }
}

/// Beta 参数必须有限且为正，否则使用先验
#[inline]
pub fn sanitize_beta_param(value: f64, prior: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        prior
    }
}

/// 先验参数：非有限或非正值回退到 1.0
#[inline]
pub fn sanitize_prior(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value.max(EPSILON)
    } else {
        1.0
    }
}

/// 检查一组概率值是否全部有限且位于 [0, 1]
pub fn all_probabilities(values: &[f64]) -> bool {
    values
        .iter()
        .all(|v| v.is_finite() && (0.0..=1.0).contains(v))
}

/// 反序列化宽松的 f64：null、缺失或非数值读作 NaN，交由后续校验替换
pub fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(json_number(value.as_ref()))
}

/// 缺失字段的默认值，与 `lenient_f64` 搭配使用
pub fn missing_f64() -> f64 {
    f64::NAN
}

/// 计数字段的无效标记，恢复时替换为默认值
pub const INVALID_COUNT: i64 = -1;

/// JSON 数值，非数值读作 NaN
pub fn json_number(value: Option<&Value>) -> f64 {
    value.and_then(Value::as_f64).unwrap_or(f64::NAN)
}

/// 整数优先读取，避免大时间戳经 f64 丢失精度；`5.0` 这类浮点计数取整
pub fn json_count(value: Option<&Value>) -> i64 {
    if let Some(n) = value.and_then(Value::as_i64) {
        return n;
    }
    let n = json_number(value);
    if n.is_finite() {
        n.round() as i64
    } else {
        INVALID_COUNT
    }
}

/// 整数字段：null、缺失或非数值读作 -1
pub fn lenient_count<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(json_count(value.as_ref()))
}

pub fn invalid_count() -> i64 {
    INVALID_COUNT
}
