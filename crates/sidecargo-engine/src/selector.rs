//! Compiles Kubernetes [`LabelSelector`]s into [`Selector`]s which can be
//! evaluated against the label set of a Pod.
//!
//! Compilation validates every requirement the same way the API server does:
//! operators must be known, binary operators (`In`, `NotIn`) need values,
//! unary operators (`Exists`, `DoesNotExist`) must not have any, keys must be
//! qualified names and values must be valid label values.
//!
//! See <https://kubernetes.io/docs/concepts/overview/working-with-objects/labels/#label-selectors>.
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
    sync::LazyLock,
};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use regex::Regex;
use snafu::{Snafu, ensure};

const KEY_PREFIX_MAX_LEN: usize = 253;
const KEY_NAME_MAX_LEN: usize = 63;
const LABEL_VALUE_MAX_LEN: usize = 63;

// Lazily initialized regular expressions
static KEY_PREFIX_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("failed to compile key prefix regex")
});

static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$")
        .expect("failed to compile key name regex")
});

type Result<T, E = SelectorError> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum SelectorError {
    #[snafu(display("label selector with binary operator {operator:?} must have values (key {key:?})"))]
    BinaryOperatorWithoutValues { operator: String, key: String },

    #[snafu(display("label selector with unary operator {operator:?} must not have values (key {key:?})"))]
    UnaryOperatorWithValues { operator: String, key: String },

    #[snafu(display("label selector has an invalid operator {operator:?}"))]
    InvalidOperator { operator: String },

    #[snafu(display("label selector key {key:?} is invalid: {reason}"))]
    InvalidKey { key: String, reason: &'static str },

    #[snafu(display("label selector value {value:?} for key {key:?} is invalid: {reason}"))]
    InvalidValue {
        key: String,
        value: String,
        reason: &'static str,
    },
}

/// The operator of a single [`Requirement`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Operator {
    /// Produced by `matchLabels` entries.
    Equals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A single validated selector term, e.g. `app in (web, api)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Requirement {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

impl Requirement {
    fn new(key: &str, operator: Operator, values: BTreeSet<String>) -> Result<Self> {
        validate_key(key)?;
        for value in &values {
            validate_value(key, value)?;
        }

        Ok(Self {
            key: key.to_owned(),
            operator,
            values,
        })
    }

    fn from_expression(expression: &LabelSelectorRequirement) -> Result<Self> {
        let key = expression.key.as_str();
        let values: BTreeSet<String> = expression.values.iter().flatten().cloned().collect();

        let operator = match expression.operator.as_str() {
            operator @ ("In" | "NotIn") => {
                ensure!(
                    !values.is_empty(),
                    BinaryOperatorWithoutValuesSnafu { operator, key }
                );

                if operator == "In" {
                    Operator::In
                } else {
                    Operator::NotIn
                }
            }
            operator @ ("Exists" | "DoesNotExist") => {
                ensure!(
                    values.is_empty(),
                    UnaryOperatorWithValuesSnafu { operator, key }
                );

                if operator == "Exists" {
                    Operator::Exists
                } else {
                    Operator::DoesNotExist
                }
            }
            operator => return InvalidOperatorSnafu { operator }.fail(),
        };

        Self::new(key, operator, values)
    }

    /// Returns if this requirement holds for the provided label set.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);

        match self.operator {
            Operator::Equals | Operator::In => value.is_some_and(|v| self.values.contains(v)),
            Operator::NotIn => value.is_none_or(|v| !self.values.contains(v)),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

impl Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let values = self
            .values
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");

        match self.operator {
            Operator::Equals => write!(f, "{key}={values}", key = self.key),
            Operator::In => write!(f, "{key} in ({values})", key = self.key),
            Operator::NotIn => write!(f, "{key} notin ({values})", key = self.key),
            Operator::Exists => write!(f, "{key}", key = self.key),
            Operator::DoesNotExist => write!(f, "!{key}", key = self.key),
        }
    }
}

/// A compiled label selector.
///
/// All requirements need to hold for the selector to match. A selector
/// without any requirements selects everything, see [`Selector::is_empty`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// Compiles and validates a [`LabelSelector`].
    ///
    /// `matchLabels` entries are treated as equality requirements. The
    /// resulting requirements are sorted by key to get a stable order.
    pub fn compile(label_selector: &LabelSelector) -> Result<Self> {
        let mut requirements = label_selector
            .match_labels
            .iter()
            .flatten()
            .map(|(key, value)| Requirement::new(key, Operator::Equals, BTreeSet::from([value.clone()])))
            .collect::<Result<Vec<_>>>()?;

        for expression in label_selector.match_expressions.iter().flatten() {
            requirements.push(Requirement::from_expression(expression)?);
        }

        requirements.sort();
        Ok(Self { requirements })
    }

    /// Returns `true` if the selector has no requirements and as such would
    /// select every label set.
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Returns if all requirements hold for the provided label set.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements
            .iter()
            .all(|requirement| requirement.matches(labels))
    }
}

impl Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let requirements = self
            .requirements
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        f.write_str(&requirements)
    }
}

/// Validates a qualified name in the format `(<PREFIX>/)<NAME>`.
fn validate_key(key: &str) -> Result<()> {
    let (prefix, name) = match key.split('/').collect::<Vec<_>>()[..] {
        [name] => (None, name),
        [prefix, name] => (Some(prefix), name),
        _ => {
            return InvalidKeySnafu {
                key,
                reason: "key prefixes cannot be nested, only use a single slash",
            }
            .fail();
        }
    };

    if let Some(prefix) = prefix {
        ensure!(
            !prefix.is_empty(),
            InvalidKeySnafu {
                key,
                reason: "prefix cannot be empty",
            }
        );
        ensure!(
            prefix.len() <= KEY_PREFIX_MAX_LEN,
            InvalidKeySnafu {
                key,
                reason: "prefix exceeds the maximum length of 253 characters",
            }
        );
        ensure!(
            KEY_PREFIX_REGEX.is_match(prefix),
            InvalidKeySnafu {
                key,
                reason: "prefix must be a lowercase DNS subdomain",
            }
        );
    }

    ensure!(
        !name.is_empty(),
        InvalidKeySnafu {
            key,
            reason: "name cannot be empty",
        }
    );
    ensure!(
        name.len() <= KEY_NAME_MAX_LEN,
        InvalidKeySnafu {
            key,
            reason: "name exceeds the maximum length of 63 characters",
        }
    );
    ensure!(
        NAME_REGEX.is_match(name),
        InvalidKeySnafu {
            key,
            reason: "name violates kubernetes format",
        }
    );

    Ok(())
}

/// Validates a label value. Values can be empty.
fn validate_value(key: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Ok(());
    }

    ensure!(
        value.len() <= LABEL_VALUE_MAX_LEN,
        InvalidValueSnafu {
            key,
            value,
            reason: "value exceeds the maximum length of 63 characters",
        }
    );
    ensure!(
        NAME_REGEX.is_match(value),
        InvalidValueSnafu {
            key,
            value,
            reason: "value violates kubernetes format",
        }
    );

    Ok(())
}
