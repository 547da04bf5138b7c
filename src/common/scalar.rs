use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A primitive value exchanged between the orchestrator and the participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Scalar {
    /// Numeric view of this scalar, only `Int` and `Float` have one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for Scalar {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<f32> for Scalar {
    fn from(value: f32) -> Self {
        Self::Float(value.into())
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<u8>> for Scalar {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// Named values reported by a participant after running a task.
pub type Metrics = BTreeMap<String, Scalar>;

/// Task configuration sent to a participant, opaque to the orchestrator.
pub type Config = BTreeMap<String, Scalar>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_values_map_to_the_narrowest_scalar() {
        let config: Config =
            serde_json::from_str(r#"{"lr": 0.5, "epochs": 3, "tag": "a", "shuffle": true}"#)
                .unwrap();

        assert_eq!(config["lr"], Scalar::Float(0.5));
        assert_eq!(config["epochs"], Scalar::Int(3));
        assert_eq!(config["tag"], Scalar::Str("a".into()));
        assert_eq!(config["shuffle"], Scalar::Bool(true));
    }

    #[test]
    fn only_numbers_have_a_numeric_view() {
        assert_eq!(Scalar::from(2).as_f64(), Some(2.0));
        assert_eq!(Scalar::from(0.25).as_f64(), Some(0.25));
        assert_eq!(Scalar::from("x").as_f64(), None);
        assert_eq!(Scalar::from(true).as_f64(), None);
    }
}
