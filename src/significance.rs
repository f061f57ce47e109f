use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{ChangeKind, EntityKind, FieldChange, Tier};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid path pattern '{pattern}': {source}")]
    Path {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid value pattern '{pattern}': {source}")]
    Value {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Optional condition on the old/new values of a change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "op", content = "value")]
pub enum ValuePredicate {
    /// Numeric change strictly larger than this percentage of the old value.
    PercentChangeOver(f64),
    /// Numeric old and new values lie on opposite sides of the threshold.
    Crosses(f64),
    /// The new value (or any string inside a new list) matches this regex.
    Matches(String),
}

/// Rule as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignificanceRule {
    pub path: String,
    #[serde(default)]
    pub entity: Option<EntityKind>,
    /// Empty means any change kind.
    #[serde(default)]
    pub kinds: Vec<ChangeKind>,
    #[serde(default)]
    pub when: Option<ValuePredicate>,
    pub tier: Tier,
}

/// Compiled dotted-glob field path matcher.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    regex: Regex,
}

impl PathPattern {
    pub fn compile(pattern: &str) -> Result<Self, RuleError> {
        let segments: Vec<&str> = pattern.split('.').collect();
        let mut out = String::from("^");
        let mut skip_sep = false;
        for (i, segment) in segments.iter().enumerate() {
            match *segment {
                "**" if i == 0 && segments.len() == 1 => out.push_str(".*"),
                "**" if i == 0 => {
                    out.push_str(r"(?:[^.]+\.)*");
                    skip_sep = true;
                }
                "**" => out.push_str(r"(?:\.[^.]+)*"),
                other => {
                    if i > 0 && !skip_sep {
                        out.push_str(r"\.");
                    }
                    skip_sep = false;
                    if other == "*" {
                        out.push_str("[^.]+");
                    } else {
                        out.push_str(&regex::escape(other));
                    }
                }
            }
        }
        out.push('$');
        let regex = Regex::new(&out).map_err(|source| RuleError::Path {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

#[derive(Debug, Clone)]
enum CompiledPredicate {
    PercentChangeOver(f64),
    Crosses(f64),
    Matches(Regex),
}

impl CompiledPredicate {
    fn holds(&self, change: &FieldChange) -> bool {
        match self {
            CompiledPredicate::PercentChangeOver(pct) => {
                match (number(&change.previous), number(&change.new)) {
                    (Some(old), Some(new)) => {
                        if old == 0.0 {
                            new != 0.0
                        } else {
                            ((new - old).abs() / old.abs()) * 100.0 > *pct
                        }
                    }
                    _ => false,
                }
            }
            CompiledPredicate::Crosses(threshold) => {
                match (number(&change.previous), number(&change.new)) {
                    (Some(old), Some(new)) => (old < *threshold) != (new < *threshold),
                    _ => false,
                }
            }
            CompiledPredicate::Matches(re) => match &change.new {
                Some(Value::String(s)) => re.is_match(s),
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|s| re.is_match(s)),
                _ => false,
            },
        }
    }
}

fn number(value: &Option<Value>) -> Option<f64> {
    value.as_ref().and_then(Value::as_f64)
}

#[derive(Debug, Clone)]
struct CompiledRule {
    path: PathPattern,
    entity: Option<EntityKind>,
    kinds: Vec<ChangeKind>,
    when: Option<CompiledPredicate>,
    tier: Tier,
}

impl CompiledRule {
    fn matches(&self, entity: EntityKind, change: &FieldChange) -> bool {
        if self.entity.is_some_and(|e| e != entity) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&change.kind) {
            return false;
        }
        if !self.path.matches(&change.path) {
            return false;
        }
        self.when.as_ref().map_or(true, |p| p.holds(change))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn compile(rules: &[SignificanceRule]) -> Result<Self, RuleError> {
        let rules = rules
            .iter()
            .map(|rule| {
                let when = match &rule.when {
                    None => None,
                    Some(ValuePredicate::PercentChangeOver(p)) => {
                        Some(CompiledPredicate::PercentChangeOver(*p))
                    }
                    Some(ValuePredicate::Crosses(t)) => Some(CompiledPredicate::Crosses(*t)),
                    Some(ValuePredicate::Matches(pattern)) => {
                        let re = Regex::new(pattern).map_err(|source| RuleError::Value {
                            pattern: pattern.clone(),
                            source,
                        })?;
                        Some(CompiledPredicate::Matches(re))
                    }
                };
                Ok(CompiledRule {
                    path: PathPattern::compile(&rule.path)?,
                    entity: rule.entity,
                    kinds: rule.kinds.clone(),
                    when,
                    tier: rule.tier,
                })
            })
            .collect::<Result<Vec<_>, RuleError>>()?;
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn classify(&self, entity: EntityKind, change: &FieldChange) -> Tier {
        self.rules
            .iter()
            .find(|rule| rule.matches(entity, change))
            .map_or(Tier::Minor, |rule| rule.tier)
    }

    pub fn apply(&self, entity: EntityKind, changes: &mut [FieldChange]) {
        for change in changes {
            change.tier = self.classify(entity, change);
        }
    }
}
