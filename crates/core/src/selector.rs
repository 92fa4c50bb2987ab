//! Kubernetes-style label selectors (`matchLabels` + `matchExpressions`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOp {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: SelectorOp,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("selector key must not be empty")]
    EmptyKey,
    #[error("operator {op:?} on key {key:?} requires at least one value")]
    MissingValues { key: String, op: SelectorOp },
    #[error("operator {op:?} on key {key:?} must not have values")]
    UnexpectedValues { key: String, op: SelectorOp },
}

/// A label selector. The empty selector matches every label set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<SelectorRequirement>,
}

impl LabelSelector {
    pub fn from_labels<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            match_labels: pairs.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            match_expressions: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), SelectorError> {
        if self.match_labels.keys().any(|k| k.is_empty()) {
            return Err(SelectorError::EmptyKey);
        }
        for req in &self.match_expressions {
            if req.key.is_empty() {
                return Err(SelectorError::EmptyKey);
            }
            match req.operator {
                SelectorOp::In | SelectorOp::NotIn if req.values.is_empty() => {
                    return Err(SelectorError::MissingValues { key: req.key.clone(), op: req.operator });
                }
                SelectorOp::Exists | SelectorOp::DoesNotExist if !req.values.is_empty() => {
                    return Err(SelectorError::UnexpectedValues { key: req.key.clone(), op: req.operator });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Whether the given label set satisfies every term of this selector.
    pub fn matches<'a, I>(&self, labels: I) -> bool
    where
        I: IntoIterator<Item = (&'a str, &'a str)> + Clone,
    {
        let lookup = |key: &str| labels.clone().into_iter().find(|(k, _)| *k == key).map(|(_, v)| v);
        for (k, v) in &self.match_labels {
            if lookup(k) != Some(v.as_str()) {
                return false;
            }
        }
        self.match_expressions.iter().all(|req| {
            let got = lookup(&req.key);
            match req.operator {
                SelectorOp::In => got.map(|v| req.values.iter().any(|x| x == v)).unwrap_or(false),
                SelectorOp::NotIn => got.map(|v| !req.values.iter().any(|x| x == v)).unwrap_or(true),
                SelectorOp::Exists => got.is_some(),
                SelectorOp::DoesNotExist => got.is_none(),
            }
        })
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts: Vec<String> = self.match_labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        for req in &self.match_expressions {
            parts.push(match req.operator {
                SelectorOp::In => format!("{} in ({})", req.key, req.values.join(",")),
                SelectorOp::NotIn => format!("{} notin ({})", req.key, req.values.join(",")),
                SelectorOp::Exists => req.key.clone(),
                SelectorOp::DoesNotExist => format!("!{}", req.key),
            });
        }
        f.write_str(&parts.join(","))
    }
}
