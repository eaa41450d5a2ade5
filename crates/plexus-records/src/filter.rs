use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::{values_equal, Record};
use crate::FilterError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Invalid regexes or bounds fail compilation.
    #[default]
    Strict,
    /// Invalid clauses compile into clauses that match nothing.
    Lenient,
}

/// Declarative predicate set over a [`Record`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct FilterSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub equals: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub regex: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<f64>,
    #[serde(default)]
    pub mode: FilterMode,
}

impl FilterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.insert(field.into(), value.into());
        self
    }

    pub fn regex(mut self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.regex.insert(field.into(), pattern.into());
        self
    }

    pub fn priority_min(mut self, min: i64) -> Self {
        self.priority_min = Some(min);
        self
    }

    pub fn since(mut self, ts: f64) -> Self {
        self.since = Some(ts);
        self
    }

    pub fn until(mut self, ts: f64) -> Self {
        self.until = Some(ts);
        self
    }

    pub fn lenient(mut self) -> Self {
        self.mode = FilterMode::Lenient;
        self
    }

    pub fn compile(self) -> Result<Filter, FilterError> {
        Filter::compile(self)
    }
}

/// A compiled [`FilterSpec`]. Pure and cheap to clone.
#[derive(Clone, Debug)]
pub struct Filter {
    spec: FilterSpec,
    // None marks a lenient clause whose pattern failed to compile
    patterns: Vec<(String, Option<Regex>)>,
    empty_window: bool,
}

impl Filter {
    pub fn compile(spec: FilterSpec) -> Result<Self, FilterError> {
        let strict = spec.mode == FilterMode::Strict;
        let mut patterns = Vec::with_capacity(spec.regex.len());
        for (field, pattern) in &spec.regex {
            match Regex::new(pattern) {
                Ok(re) => patterns.push((field.clone(), Some(re))),
                Err(err) if strict => {
                    return Err(FilterError::InvalidRegex {
                        field: field.clone(),
                        pattern: pattern.clone(),
                        reason: err.to_string(),
                    })
                }
                Err(_) => patterns.push((field.clone(), None)),
            }
        }
        let empty_window = matches!((spec.since, spec.until), (Some(s), Some(u)) if s > u);
        if empty_window && strict {
            return Err(FilterError::InvalidBounds {
                since: spec.since.unwrap_or_default(),
                until: spec.until.unwrap_or_default(),
            });
        }
        Ok(Self {
            spec,
            patterns,
            empty_window,
        })
    }

    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    pub fn matches(&self, record: &Record) -> bool {
        if self.empty_window {
            return false;
        }
        if let Some(min) = self.spec.priority_min {
            if record.priority() < min {
                return false;
            }
        }
        if self.spec.since.is_some() || self.spec.until.is_some() {
            let Some(ts) = record.timestamp() else {
                return false;
            };
            if self.spec.since.is_some_and(|since| ts < since) {
                return false;
            }
            if self.spec.until.is_some_and(|until| ts > until) {
                return false;
            }
        }
        for (field, expected) in &self.spec.equals {
            match record.field(field) {
                Some(actual) if values_equal(&actual, expected) => {}
                _ => return false,
            }
        }
        for (field, pattern) in &self.patterns {
            let Some(re) = pattern else {
                return false;
            };
            let Some(value) = record.field(field) else {
                return false;
            };
            let text = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            if !re.is_match(&text) {
                return false;
            }
        }
        true
    }
}
