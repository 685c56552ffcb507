use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use super::RunIdentity;

/// 约简变量, 保持消息中的键顺序
pub type VariableMap = serde_json::Map<String, serde_json::Value>;

/// 实验编号 (RB号), 消息中可能是整数也可能是字符串
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExperimentId {
    Number(i64),
    Text(String),
}

impl ExperimentId {
    /// 按整数解析, 字符串形式的整数同样有效
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ExperimentId::Number(n) => Some(*n),
            ExperimentId::Text(s) => s.trim().parse().ok(),
        }
    }

    /// 比较和存储用的规范形式: 整数形式的字符串转为整数, `"42"` 与 `42` 相同
    pub fn normalized(&self) -> ExperimentId {
        self.as_integer()
            .map_or_else(|| self.clone(), ExperimentId::Number)
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExperimentId::Number(n) => write!(f, "{n}"),
            ExperimentId::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for ExperimentId {
    fn from(n: i64) -> Self {
        ExperimentId::Number(n)
    }
}

impl From<&str> for ExperimentId {
    fn from(s: &str) -> Self {
        ExperimentId::Text(s.to_string())
    }
}

/// 作业消息, 接收后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    #[serde(deserialize_with = "positive_run_number")]
    pub run_number: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub run_version: u32,
    #[serde(alias = "rb_number")]
    pub experiment_id: ExperimentId,
    #[serde(default)]
    pub instrument: String,
    #[serde(default, alias = "data")]
    pub data_path: String,
    #[serde(default, alias = "reduction_script")]
    pub script_text: String,
    #[serde(default)]
    pub standard_vars: VariableMap,
    #[serde(default)]
    pub advanced_vars: VariableMap,
    #[serde(default = "default_facility")]
    pub facility: String,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub cancel: bool,
}

fn default_facility() -> String {
    "ISIS".to_string()
}

fn positive_run_number<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match u64::deserialize(deserializer)? {
        0 => Err(serde::de::Error::custom("run_number 必须为正整数")),
        n => Ok(n),
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl JobMessage {
    pub fn identity(&self) -> RunIdentity {
        RunIdentity::new(self.experiment_id.clone(), self.run_number, self.run_version)
    }

    pub fn from_slice(payload: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn to_vec(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 生成同一运行的另一个版本
    pub fn with_version(&self, run_version: u32) -> Self {
        Self {
            run_version,
            cancel: false,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_with_aliases_and_defaults() {
        let payload = json!({
            "run_number": 12345,
            "run_version": null,
            "rb_number": "1910232",
            "instrument": "GEM",
            "data": "\\\\isis\\inst$\\NDXGEM\\Instrument\\data\\GEM12345.nxs",
            "reduction_script": "print('hi')",
            "standard_vars": {"b": 1, "a": [1, 2]}
        });
        let job: JobMessage = serde_json::from_value(payload).unwrap();

        assert_eq!(job.run_version, 0);
        assert_eq!(job.experiment_id, ExperimentId::Text("1910232".to_string()));
        assert_eq!(job.experiment_id.as_integer(), Some(1910232));
        assert_eq!(job.facility, "ISIS");
        assert!(!job.cancel);
        let keys: Vec<_> = job.standard_vars.keys().cloned().collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn test_experiment_id_integer_forms() {
        assert_eq!(ExperimentId::Number(7).as_integer(), Some(7));
        assert_eq!(ExperimentId::from("abc").as_integer(), None);
        assert_eq!(ExperimentId::from("-3").as_integer(), Some(-3));
        assert_eq!(ExperimentId::from("abc").to_string(), "abc");
    }

    #[test]
    fn test_with_version_clears_cancel() {
        let job: JobMessage = serde_json::from_value(json!({
            "run_number": 1, "experiment_id": 42, "cancel": true
        }))
        .unwrap();
        let retry = job.with_version(3);
        assert_eq!(retry.identity(), RunIdentity::new(42_i64, 1, 3));
        assert!(!retry.cancel);
    }

    #[test]
    fn test_identity_normalizes_experiment() {
        let numeric: JobMessage = serde_json::from_value(json!({
            "run_number": 12, "experiment_id": 42
        }))
        .unwrap();
        let textual: JobMessage = serde_json::from_value(json!({
            "run_number": 12, "experiment_id": "42"
        }))
        .unwrap();
        let other: JobMessage = serde_json::from_value(json!({
            "run_number": 12, "experiment_id": 43
        }))
        .unwrap();

        assert_eq!(numeric.identity(), textual.identity());
        assert_ne!(numeric.identity(), other.identity());
        assert_eq!(
            ExperimentId::from("abc").normalized(),
            ExperimentId::Text("abc".to_string())
        );
    }

    #[test]
    fn test_zero_run_number_rejected() {
        let payload = json!({"run_number": 0, "experiment_id": 42}).to_string();
        assert!(JobMessage::from_slice(payload.as_bytes()).is_err());
    }
}
