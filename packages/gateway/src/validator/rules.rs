// ABOUTME: Data-driven validator rules and their compiled matchers
// ABOUTME: Rules deserialize from JSON and compile into regexes once at startup

use super::ValidatorError;
use crate::types::Confidence;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const BUILTIN_RULES: &str = include_str!("../../config/rules.json");

fn default_max_repeat() -> u64 {
    10_000_000
}

/// The check a rule performs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RuleKind {
    ForbiddenModules {
        modules: Vec<String>,
    },
    ForbiddenCalls {
        names: Vec<String>,
    },
    InfiniteLoop,
    MemoryBomb {
        #[serde(rename = "maxRepeat", default = "default_max_repeat")]
        max_repeat: u64,
    },
    SuspiciousOpen,
    Pattern {
        name: String,
        regex: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    #[serde(flatten)]
    pub kind: RuleKind,
    pub confidence: Confidence,
    pub reason: String,
}

/// Rules shipped with the gateway
pub fn builtin_rules() -> Result<Vec<RuleSpec>, ValidatorError> {
    serde_json::from_str(BUILTIN_RULES).map_err(ValidatorError::Parse)
}

pub(crate) enum Matcher {
    ForbiddenModules(HashSet<String>),
    ForbiddenCalls(Vec<(String, Regex)>),
    InfiniteLoop,
    MemoryBomb(u64),
    SuspiciousOpen,
    Pattern { name: String, regex: Regex },
}

pub(crate) struct CompiledRule {
    pub matcher: Matcher,
    pub confidence: Confidence,
    pub reason: String,
}

impl CompiledRule {
    pub fn compile(spec: &RuleSpec) -> Result<Self, ValidatorError> {
        let matcher = match &spec.kind {
            RuleKind::ForbiddenModules { modules } => Matcher::ForbiddenModules(
                modules.iter().map(|m| m.trim().to_string()).collect(),
            ),
            RuleKind::ForbiddenCalls { names } => {
                let mut calls = Vec::with_capacity(names.len());
                for name in names {
                    let pattern = format!(r"(?:^|[^\w.]){}\s*\(", regex::escape(name.trim()));
                    let regex = Regex::new(&pattern).map_err(|source| {
                        ValidatorError::InvalidPattern {
                            name: name.clone(),
                            source,
                        }
                    })?;
                    calls.push((name.trim().to_string(), regex));
                }
                Matcher::ForbiddenCalls(calls)
            }
            RuleKind::InfiniteLoop => Matcher::InfiniteLoop,
            RuleKind::MemoryBomb { max_repeat } => Matcher::MemoryBomb(*max_repeat),
            RuleKind::SuspiciousOpen => Matcher::SuspiciousOpen,
            RuleKind::Pattern { name, regex } => Matcher::Pattern {
                name: name.clone(),
                regex: Regex::new(regex).map_err(|source| ValidatorError::InvalidPattern {
                    name: name.clone(),
                    source,
                })?,
            },
        };

        Ok(Self {
            matcher,
            confidence: spec.confidence,
            reason: spec.reason.clone(),
        })
    }
}
