//! Device approval policy
//!
//! Decides whether a discovered device is auto-attached (`spec.managed =
//! true`) or left pending manual approval. The selector mode compiles a
//! Kubernetes-style label selector at construction; a selector that fails to
//! compile makes the whole policy unusable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Approval modes. Unknown configuration values fall back to manual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    #[default]
    Manual,
    Automatic,
    Selector,
}

impl ApprovalMode {
    /// Parse a configured mode string; anything unrecognized is manual.
    pub fn parse(s: &str) -> Self {
        match s {
            "automatic" => ApprovalMode::Automatic,
            "selector" => ApprovalMode::Selector,
            _ => ApprovalMode::Manual,
        }
    }
}

/// One selector requirement in `matchExpressions` form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: String,
    pub values: Vec<String>,
}

/// Label selector configuration: `matchLabels` plus `matchExpressions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelSelectorConfig {
    pub match_labels: BTreeMap<String, String>,
    pub match_expressions: Vec<SelectorRequirement>,
}

/// Errors raised while compiling a selector. Fatal at policy construction.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("unknown selector operator {operator:?} for key {key:?}")]
    UnknownOperator { key: String, operator: String },
    #[error("selector operator {operator} on key {key:?} requires values")]
    MissingValues { key: String, operator: String },
    #[error("selector operator {operator} on key {key:?} takes no values")]
    UnexpectedValues { key: String, operator: String },
    #[error("selector requirement has an empty key")]
    EmptyKey,
}

#[derive(Debug, Clone)]
enum Requirement {
    Eq(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Eq(key, value) => labels.get(key) == Some(value),
            Requirement::In(key, values) => {
                labels.get(key).is_some_and(|v| values.contains(v))
            }
            Requirement::NotIn(key, values) => {
                !labels.get(key).is_some_and(|v| values.contains(v))
            }
            Requirement::Exists(key) => labels.contains_key(key),
            Requirement::DoesNotExist(key) => !labels.contains_key(key),
        }
    }
}

/// A compiled label selector: the conjunction of all requirements.
#[derive(Debug, Clone, Default)]
pub struct CompiledSelector {
    requirements: Vec<Requirement>,
}

impl CompiledSelector {
    pub fn compile(config: &LabelSelectorConfig) -> Result<Self, ApprovalError> {
        let mut requirements = Vec::new();

        for (key, value) in &config.match_labels {
            if key.is_empty() {
                return Err(ApprovalError::EmptyKey);
            }
            requirements.push(Requirement::Eq(key.clone(), value.clone()));
        }

        for expr in &config.match_expressions {
            if expr.key.is_empty() {
                return Err(ApprovalError::EmptyKey);
            }
            let requirement = match expr.operator.as_str() {
                "In" => {
                    if expr.values.is_empty() {
                        return Err(ApprovalError::MissingValues {
                            key: expr.key.clone(),
                            operator: expr.operator.clone(),
                        });
                    }
                    Requirement::In(expr.key.clone(), expr.values.clone())
                }
                "NotIn" => {
                    if expr.values.is_empty() {
                        return Err(ApprovalError::MissingValues {
                            key: expr.key.clone(),
                            operator: expr.operator.clone(),
                        });
                    }
                    Requirement::NotIn(expr.key.clone(), expr.values.clone())
                }
                "Exists" => {
                    if !expr.values.is_empty() {
                        return Err(ApprovalError::UnexpectedValues {
                            key: expr.key.clone(),
                            operator: expr.operator.clone(),
                        });
                    }
                    Requirement::Exists(expr.key.clone())
                }
                "DoesNotExist" => {
                    if !expr.values.is_empty() {
                        return Err(ApprovalError::UnexpectedValues {
                            key: expr.key.clone(),
                            operator: expr.operator.clone(),
                        });
                    }
                    Requirement::DoesNotExist(expr.key.clone())
                }
                _ => {
                    return Err(ApprovalError::UnknownOperator {
                        key: expr.key.clone(),
                        operator: expr.operator.clone(),
                    })
                }
            };
            requirements.push(requirement);
        }

        Ok(Self { requirements })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

/// Approval policy evaluated per discovered device.
#[derive(Debug, Clone, Default)]
pub struct ApprovalPolicy {
    mode: ApprovalMode,
    selector: Option<CompiledSelector>,
}

impl ApprovalPolicy {
    /// Build a policy. A selector compile failure is a hard error; the
    /// policy must not be used.
    pub fn new(
        mode: ApprovalMode,
        selector: Option<&LabelSelectorConfig>,
    ) -> Result<Self, ApprovalError> {
        let selector = match (mode, selector) {
            (ApprovalMode::Selector, Some(config)) => Some(CompiledSelector::compile(config)?),
            _ => None,
        };
        Ok(Self { mode, selector })
    }

    pub fn mode(&self) -> ApprovalMode {
        self.mode
    }

    /// Whether a discovered device on the given node is auto-attached.
    /// Unmanaged nodes never auto-attach.
    pub fn auto_attach(&self, node_managed: bool, node_labels: &BTreeMap<String, String>) -> bool {
        if !node_managed {
            return false;
        }
        match self.mode {
            ApprovalMode::Manual => false,
            ApprovalMode::Automatic => true,
            ApprovalMode::Selector => self
                .selector
                .as_ref()
                .map(|s| s.matches(node_labels))
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_mode_parse_fallback() {
        assert_eq!(ApprovalMode::parse("automatic"), ApprovalMode::Automatic);
        assert_eq!(ApprovalMode::parse("selector"), ApprovalMode::Selector);
        assert_eq!(ApprovalMode::parse("manual"), ApprovalMode::Manual);
        assert_eq!(ApprovalMode::parse("whatever"), ApprovalMode::Manual);
        assert_eq!(ApprovalMode::parse(""), ApprovalMode::Manual);
    }

    #[test]
    fn test_manual_never_attaches() {
        let policy = ApprovalPolicy::new(ApprovalMode::Manual, None).unwrap();
        assert!(!policy.auto_attach(true, &labels(&[("a", "b")])));
    }

    #[test]
    fn test_automatic_attaches_managed_only() {
        let policy = ApprovalPolicy::new(ApprovalMode::Automatic, None).unwrap();
        assert!(policy.auto_attach(true, &BTreeMap::new()));
        assert!(!policy.auto_attach(false, &BTreeMap::new()));
    }

    #[test]
    fn test_selector_match_labels() {
        let config = LabelSelectorConfig {
            match_labels: labels(&[("gpu.inventory.dev/device.vendor", "10de")]),
            ..Default::default()
        };
        let policy = ApprovalPolicy::new(ApprovalMode::Selector, Some(&config)).unwrap();

        assert!(policy.auto_attach(true, &labels(&[("gpu.inventory.dev/device.vendor", "10de")])));
        assert!(!policy.auto_attach(true, &labels(&[("gpu.inventory.dev/device.vendor", "1234")])));
        assert!(!policy.auto_attach(false, &labels(&[("gpu.inventory.dev/device.vendor", "10de")])));
    }

    #[test]
    fn test_selector_match_expressions() {
        let config = LabelSelectorConfig {
            match_expressions: vec![
                SelectorRequirement {
                    key: "tier".to_string(),
                    operator: "In".to_string(),
                    values: vec!["a100".to_string(), "h100".to_string()],
                },
                SelectorRequirement {
                    key: "quarantined".to_string(),
                    operator: "DoesNotExist".to_string(),
                    values: Vec::new(),
                },
            ],
            ..Default::default()
        };
        let policy = ApprovalPolicy::new(ApprovalMode::Selector, Some(&config)).unwrap();

        assert!(policy.auto_attach(true, &labels(&[("tier", "a100")])));
        assert!(!policy.auto_attach(true, &labels(&[("tier", "v100")])));
        assert!(!policy.auto_attach(true, &labels(&[("tier", "a100"), ("quarantined", "")])));
    }

    #[test]
    fn test_selector_compile_failures() {
        let config = LabelSelectorConfig {
            match_expressions: vec![SelectorRequirement {
                key: "tier".to_string(),
                operator: "Near".to_string(),
                values: Vec::new(),
            }],
            ..Default::default()
        };
        assert!(matches!(
            ApprovalPolicy::new(ApprovalMode::Selector, Some(&config)),
            Err(ApprovalError::UnknownOperator { .. })
        ));

        let config = LabelSelectorConfig {
            match_expressions: vec![SelectorRequirement {
                key: "tier".to_string(),
                operator: "In".to_string(),
                values: Vec::new(),
            }],
            ..Default::default()
        };
        assert!(matches!(
            ApprovalPolicy::new(ApprovalMode::Selector, Some(&config)),
            Err(ApprovalError::MissingValues { .. })
        ));
    }

    #[test]
    fn test_selector_mode_without_matcher_is_false() {
        let policy = ApprovalPolicy::new(ApprovalMode::Selector, None).unwrap();
        assert!(!policy.auto_attach(true, &labels(&[("a", "b")])));
    }
}
