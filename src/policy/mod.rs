//! Deny-rule policy evaluation.
//!
//! A policy is an ordered list of deny rules, evaluated against a call's
//! `(module, host, environment, params)`. First matching rule wins; no
//! match is an allow. There is no allow-rule concept: a policy can only
//! narrow what's permitted, never widen it past "everything."
//!
//! Evaluation runs after the replay check and before secret injection, so
//! a deny decision never sees a resolved secret value.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A single match clause within a rule. All stated fields must match for
/// the rule as a whole to match; an unset field is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Match {
    /// Glob against the module FQCN.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,

    /// Glob against the host name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Exact match against the context environment string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,

    /// `param.<k>` clauses: key is the param name, value is a glob
    /// compared against the stringified param value.
    #[serde(flatten)]
    pub params: IndexMap<String, String>,
}

/// A single deny rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Clauses that must all match.
    #[serde(rename = "match")]
    pub match_: Match,

    /// Human-readable reason, surfaced in the denial error.
    pub reason: String,
}

/// Result of evaluating a policy against a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
}

/// An ordered set of deny rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    rules: Vec<Rule>,
}

impl Policy {
    /// An empty policy. Always allows.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Parse a policy document (a list of rules, each `{match, reason}`).
    pub fn parse(document: &str) -> Result<Self> {
        serde_yaml::from_str(document).map_err(|e| Error::PolicyInvalid(e.to_string()))
    }

    /// Append a rule, in evaluation order.
    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Evaluate the policy against a call. Rules are checked in declaration
    /// order; the first match decides.
    pub fn evaluate(&self, module: &str, host: &str, environment: &str, params: &IndexMap<String, Value>) -> Decision {
        for rule in &self.rules {
            if rule_matches(&rule.match_, module, host, environment, params) {
                return Decision::Deny(rule.reason.clone());
            }
        }
        Decision::Allow
    }
}

fn rule_matches(m: &Match, module: &str, host: &str, environment: &str, params: &IndexMap<String, Value>) -> bool {
    if let Some(pattern) = &m.module {
        if !glob_matches(pattern, module) {
            return false;
        }
    }
    if let Some(pattern) = &m.host {
        if !glob_matches(pattern, host) {
            return false;
        }
    }
    if let Some(expected) = &m.environment {
        if expected != environment {
            return false;
        }
    }
    for (key, pattern) in &m.params {
        let Some(param_key) = key.strip_prefix("param.") else {
            continue;
        };
        let actual = match params.get(param_key) {
            Some(value) => stringify(value),
            None => return false,
        };
        if !glob_matches(pattern, &actual) {
            return false;
        }
    }
    true
}

fn glob_matches(pattern: &str, text: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches(text))
        .unwrap_or_else(|_| pattern == text)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
