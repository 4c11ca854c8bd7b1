// ABOUTME: Static safety analysis of submitted Python source
// ABOUTME: Runs an ordered, data-driven rule list over comment-stripped source and returns a verdict

mod rules;

pub use rules::{builtin_rules, RuleKind, RuleSpec};

use crate::settings::ValidatorConfig;
use crate::types::{Confidence, SourceFile};
use lazy_static::lazy_static;
use regex::Regex;
use rules::{CompiledRule, Matcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValidatorError {
    #[error("Failed to parse rules: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Rule '{name}' has an invalid pattern: {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationVerdict {
    pub safe: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ValidationVerdict {
    pub fn pass() -> Self {
        Self {
            safe: true,
            rule_id: None,
            confidence: None,
            reason: None,
        }
    }

    fn fail(rule_id: String, confidence: Confidence, reason: String) -> Self {
        Self {
            safe: false,
            rule_id: Some(rule_id),
            confidence: Some(confidence),
            reason: Some(reason),
        }
    }

    fn is_high(&self) -> bool {
        !self.safe && self.confidence == Some(Confidence::High)
    }
}

/// Which unsafe verdicts stop a request; high confidence always does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationPolicy {
    pub reject_medium: bool,
    pub reject_low: bool,
}

impl ValidationPolicy {
    pub fn from_config(config: &ValidatorConfig) -> Self {
        Self {
            reject_medium: config.reject_medium,
            reject_low: config.reject_low,
        }
    }

    pub fn rejects(&self, verdict: &ValidationVerdict) -> bool {
        match (verdict.safe, verdict.confidence) {
            (true, _) => false,
            (false, Some(Confidence::Medium)) => self.reject_medium,
            (false, Some(Confidence::Low)) => self.reject_low,
            (false, _) => true,
        }
    }
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            reject_medium: true,
            reject_low: true,
        }
    }
}

lazy_static! {
    static ref IMPORT_RE: Regex = Regex::new(r"^\s*import\s+(.+)$").unwrap();
    static ref FROM_IMPORT_RE: Regex =
        Regex::new(r"^\s*from\s+(\.*)([\w.]*)\s+import\b").unwrap();
    static ref IDENT_RE: Regex = Regex::new(r"^[A-Za-z_]\w*$").unwrap();
    static ref WHILE_TRUE_RE: Regex =
        Regex::new(r"^(\s*)while\s+(?:True|1|\(\s*True\s*\)|\(\s*1\s*\))\s*:(.*)$").unwrap();
    static ref LOOP_HEADER_RE: Regex = Regex::new(r"^(?:async\s+)?(?:for|while)\b").unwrap();
    static ref LOOP_EXIT_RE: Regex =
        Regex::new(r"\b(?:break|return|raise)\b|\b(?:sys\.exit|exit|quit)\s*\(").unwrap();
    static ref LIST_LEFT_RE: Regex = Regex::new(
        r"(?:^|[^\w\)\]])\[[^\[\]]*\]\s*\*\s*(\d[\d_]*)(?:\s*\*\*\s*(\d[\d_]*))?"
    )
    .unwrap();
    static ref LIST_RIGHT_RE: Regex =
        Regex::new(r"(\d[\d_]*)(?:\s*\*\*\s*(\d[\d_]*))?\s*\*\s*\[").unwrap();
    static ref STR_LEFT_RE: Regex =
        Regex::new(r#"["']\s*\*\s*(\d[\d_]*)(?:\s*\*\*\s*(\d[\d_]*))?"#).unwrap();
    static ref STR_RIGHT_RE: Regex =
        Regex::new(r#"(\d[\d_]*)(?:\s*\*\*\s*(\d[\d_]*))?\s*\*\s*["']"#).unwrap();
    static ref ALLOC_RE: Regex = Regex::new(
        r"(?:\b(?:bytearray|bytes)|\blist\s*\(\s*range)\s*\(\s*(\d[\d_]*)(?:\s*\*\*\s*(\d[\d_]*))?\s*\)"
    )
    .unwrap();
    static ref OPEN_RE: Regex = Regex::new(
        r#"(?:^|[^\w.])(?:io\.)?open\s*\(\s*[rRbBuUfF]{0,2}(?:"([^"]*)"|'([^']*)')"#
    )
    .unwrap();
    static ref DRIVE_PATH_RE: Regex = Regex::new(r"^[A-Za-z]:").unwrap();
}

/// Source split into lines with comments removed; `masked` also blanks string contents
struct PreparedSource {
    code: Vec<String>,
    masked: Vec<String>,
}

#[derive(Clone, Copy)]
enum ScanState {
    Code,
    Str { quote: char, triple: bool },
}

impl PreparedSource {
    fn new(source: &str) -> Self {
        let mut code = Vec::new();
        let mut masked = Vec::new();
        let mut open_triple: Option<char> = None;

        for line in source.lines() {
            let (code_line, masked_line, carry) = scan_line(line, open_triple);
            code.push(code_line);
            masked.push(masked_line);
            open_triple = carry;
        }

        Self { code, masked }
    }
}

fn scan_line(line: &str, open_triple: Option<char>) -> (String, String, Option<char>) {
    let chars: Vec<char> = line.chars().collect();
    let mut code = String::with_capacity(line.len());
    let mut masked = String::with_capacity(line.len());
    let mut state = match open_triple {
        Some(quote) => ScanState::Str {
            quote,
            triple: true,
        },
        None => ScanState::Code,
    };

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match state {
            ScanState::Code => {
                if c == '#' {
                    break;
                }
                if c == '"' || c == '\'' {
                    let triple = chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c);
                    let width = if triple { 3 } else { 1 };
                    for _ in 0..width {
                        code.push(c);
                        masked.push(c);
                    }
                    state = ScanState::Str { quote: c, triple };
                    i += width;
                    continue;
                }
                code.push(c);
                masked.push(c);
            }
            ScanState::Str { quote, triple } => {
                if c == '\\' {
                    code.push(c);
                    masked.push(' ');
                    if let Some(&next) = chars.get(i + 1) {
                        code.push(next);
                        masked.push(' ');
                    }
                    i += 2;
                    continue;
                }
                if c == quote {
                    let closes = !triple
                        || (chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote));
                    if closes {
                        let width = if triple { 3 } else { 1 };
                        for _ in 0..width {
                            code.push(c);
                            masked.push(c);
                        }
                        state = ScanState::Code;
                        i += width;
                        continue;
                    }
                }
                code.push(c);
                masked.push(' ');
            }
        }
        i += 1;
    }

    let carry = match state {
        ScanState::Str {
            quote,
            triple: true,
        } => Some(quote),
        _ => None,
    };
    (code, masked, carry)
}

/// Root package names imported by `source`, in first-seen order
pub fn extract_imports(source: &str) -> Vec<String> {
    imports_with_lines(&PreparedSource::new(source))
        .into_iter()
        .map(|(module, _)| module)
        .collect()
}

fn imports_with_lines(prepared: &PreparedSource) -> Vec<(String, usize)> {
    let mut found: Vec<(String, usize)> = Vec::new();
    let mut push = |module: &str, line: usize| {
        if IDENT_RE.is_match(module) && !found.iter().any(|(m, _)| m == module) {
            found.push((module.to_string(), line));
        }
    };

    for (index, line) in prepared.masked.iter().enumerate() {
        for statement in line.split(';') {
            if let Some(caps) = FROM_IMPORT_RE.captures(statement) {
                let relative = caps.get(1).map_or(false, |m| !m.as_str().is_empty());
                if !relative {
                    if let Some(module) = caps.get(2) {
                        let root = module.as_str().split('.').next().unwrap_or_default();
                        push(root, index + 1);
                    }
                }
            } else if let Some(caps) = IMPORT_RE.captures(statement) {
                let names = caps.get(1).map_or("", |m| m.as_str());
                for item in names.split(',') {
                    let item = item.trim().trim_start_matches('(').trim_end_matches(')');
                    let dotted = item.split_whitespace().next().unwrap_or_default();
                    let root = dotted.split('.').next().unwrap_or_default();
                    push(root, index + 1);
                }
            }
        }
    }

    found
}

fn indent_of(line: &str) -> usize {
    line.chars()
        .take_while(|c| c.is_whitespace())
        .map(|c| if c == '\t' { 8 } else { 1 })
        .sum()
}

/// Line of the first `while True` whose body never leaves the loop
fn find_unbounded_loop(lines: &[String]) -> Option<usize> {
    for (index, line) in lines.iter().enumerate() {
        let Some(caps) = WHILE_TRUE_RE.captures(line) else {
            continue;
        };
        let tail = caps.get(2).map_or("", |m| m.as_str());
        if !tail.trim().is_empty() {
            if !LOOP_EXIT_RE.is_match(tail) {
                return Some(index + 1);
            }
            continue;
        }

        let loop_indent = indent_of(line);
        let mut inner_loops: Vec<usize> = Vec::new();
        let mut exits = false;

        for body in lines.iter().skip(index + 1) {
            if body.trim().is_empty() {
                continue;
            }
            let indent = indent_of(body);
            if indent <= loop_indent {
                break;
            }
            while inner_loops.last().is_some_and(|&top| indent <= top) {
                inner_loops.pop();
            }
            let stripped = body.trim_start();
            if LOOP_HEADER_RE.is_match(stripped) {
                inner_loops.push(indent);
                continue;
            }
            let leaves_outer = if inner_loops.is_empty() {
                LOOP_EXIT_RE.is_match(stripped)
            } else {
                stripped.starts_with("return") || stripped.starts_with("raise")
            };
            if leaves_outer {
                exits = true;
                break;
            }
        }

        if !exits {
            return Some(index + 1);
        }
    }
    None
}

fn parse_digits(m: regex::Match<'_>) -> u128 {
    m.as_str().replace('_', "").parse::<u128>().unwrap_or(u128::MAX)
}

fn literal_value(base: Option<regex::Match<'_>>, exponent: Option<regex::Match<'_>>) -> u128 {
    let Some(base) = base.map(parse_digits) else {
        return 0;
    };
    match exponent.map(parse_digits) {
        None => base,
        Some(exp) => u32::try_from(exp)
            .ok()
            .and_then(|e| base.checked_pow(e))
            .unwrap_or(u128::MAX),
    }
}

fn find_memory_bomb(lines: &[String], max_repeat: u64) -> Option<(usize, u128)> {
    let patterns: [&Regex; 5] = [
        &*LIST_LEFT_RE,
        &*LIST_RIGHT_RE,
        &*STR_LEFT_RE,
        &*STR_RIGHT_RE,
        &*ALLOC_RE,
    ];
    for (index, line) in lines.iter().enumerate() {
        for pattern in patterns {
            for caps in pattern.captures_iter(line) {
                let value = literal_value(caps.get(1), caps.get(2));
                if value > u128::from(max_repeat) {
                    return Some((index + 1, value));
                }
            }
        }
    }
    None
}

fn is_suspicious_path(path: &str) -> bool {
    path.starts_with('/')
        || path.starts_with('~')
        || path.starts_with('\\')
        || path.contains("..")
        || DRIVE_PATH_RE.is_match(path)
}

fn find_suspicious_open(lines: &[String]) -> Option<(usize, String)> {
    for (index, line) in lines.iter().enumerate() {
        for caps in OPEN_RE.captures_iter(line) {
            let path = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map_or("", |m| m.as_str());
            if is_suspicious_path(path) {
                return Some((index + 1, path.to_string()));
            }
        }
    }
    None
}

/// Rule-based pre-execution filter
pub struct Validator {
    rules: Vec<CompiledRule>,
}

impl Validator {
    pub fn new(specs: &[RuleSpec]) -> Result<Self, ValidatorError> {
        let rules = specs
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn builtin() -> Result<Self, ValidatorError> {
        Self::new(&builtin_rules()?)
    }

    pub fn from_config(config: &ValidatorConfig) -> Result<Self, ValidatorError> {
        match &config.rules {
            Some(specs) => Self::new(specs),
            None => Self::builtin(),
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Validate one source file
    pub fn validate(&self, source: &str) -> ValidationVerdict {
        self.validate_named(None, source)
    }

    /// Validate a project; any unsafe file fails the whole request
    pub fn validate_files(&self, files: &[SourceFile]) -> ValidationVerdict {
        let mut first_soft: Option<ValidationVerdict> = None;
        for file in files {
            let verdict = self.validate_named(Some(&file.path), &file.content);
            if verdict.is_high() {
                return verdict;
            }
            if !verdict.safe && first_soft.is_none() {
                first_soft = Some(verdict);
            }
        }
        first_soft.unwrap_or_else(ValidationVerdict::pass)
    }

    fn validate_named(&self, file: Option<&str>, source: &str) -> ValidationVerdict {
        let prepared = PreparedSource::new(source);
        let location = |line: usize| match file {
            Some(path) => format!("{}:{}", path, line),
            None => format!("line {}", line),
        };

        let mut first_soft: Option<ValidationVerdict> = None;
        for rule in &self.rules {
            let Some((rule_id, detail)) = Self::check(rule, &prepared, &location) else {
                continue;
            };
            let verdict = ValidationVerdict::fail(
                rule_id,
                rule.confidence,
                format!("{}: {}", rule.reason, detail),
            );
            if rule.confidence == Confidence::High {
                return verdict;
            }
            if first_soft.is_none() {
                first_soft = Some(verdict);
            }
        }
        first_soft.unwrap_or_else(ValidationVerdict::pass)
    }

    fn check(
        rule: &CompiledRule,
        prepared: &PreparedSource,
        location: &dyn Fn(usize) -> String,
    ) -> Option<(String, String)> {
        match &rule.matcher {
            Matcher::ForbiddenModules(modules) => imports_with_lines(prepared)
                .into_iter()
                .find(|(module, _)| modules.contains(module))
                .map(|(module, line)| {
                    (
                        format!("forbidden_module:{}", module),
                        format!("module '{}' ({})", module, location(line)),
                    )
                }),
            Matcher::ForbiddenCalls(calls) => {
                for (index, line) in prepared.masked.iter().enumerate() {
                    for (name, regex) in calls {
                        if regex.is_match(line) {
                            return Some((
                                format!("forbidden_call:{}", name),
                                format!("call to '{}' ({})", name, location(index + 1)),
                            ));
                        }
                    }
                }
                None
            }
            Matcher::InfiniteLoop => find_unbounded_loop(&prepared.masked).map(|line| {
                (
                    "infinite_loop".to_string(),
                    format!("loop never breaks ({})", location(line)),
                )
            }),
            Matcher::MemoryBomb(max_repeat) => find_memory_bomb(&prepared.masked, *max_repeat)
                .map(|(line, value)| {
                    (
                        "memory_bomb".to_string(),
                        format!("repeat count {} ({})", value, location(line)),
                    )
                }),
            Matcher::SuspiciousOpen => find_suspicious_open(&prepared.code).map(|(line, path)| {
                (
                    "suspicious_open".to_string(),
                    format!("path '{}' ({})", path, location(line)),
                )
            }),
            Matcher::Pattern { name, regex } => prepared
                .code
                .iter()
                .position(|line| regex.is_match(line))
                .map(|index| {
                    (
                        format!("pattern:{}", name),
                        format!("matched '{}' ({})", name, location(index + 1)),
                    )
                }),
        }
    }
}
