// ABOUTME: Request and result types shared by every gateway stage
// ABOUTME: Tiers, engines, inbound execution requests and the normalized outbound result

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Default entry point used when a request does not name one
pub const DEFAULT_ENTRY_POINT: &str = "main.py";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Anonymous,
    Free,
    Paid,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Anonymous, Tier::Free, Tier::Paid];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Anonymous => "anonymous",
            Tier::Free => "free",
            Tier::Paid => "paid",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anonymous" => Ok(Tier::Anonymous),
            "free" => Ok(Tier::Free),
            "paid" => Ok(Tier::Paid),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Light,
    Heavy,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Light => "light",
            Engine::Heavy => "heavy",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "light" => Ok(Engine::Light),
            "heavy" => Ok(Engine::Heavy),
            other => Err(format!("unknown engine '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Submitted code: either one source string or a list of project files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CodeInput {
    Source(String),
    Files(Vec<SourceFile>),
}

/// An immutable code-execution request with its resolved identity and tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub code: CodeInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_hint: Option<Engine>,
    #[serde(default)]
    pub identity: Option<String>,
    /// Filled in by the transport from the peer address, never by the client
    #[serde(skip)]
    pub client_addr: Option<IpAddr>,
    pub tier: Tier,
    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
}

impl ExecutionRequest {
    pub fn source(code: impl Into<String>, tier: Tier) -> Self {
        Self {
            code: CodeInput::Source(code.into()),
            entry_point: None,
            engine_hint: None,
            identity: None,
            client_addr: None,
            tier,
            submitted_at: Utc::now(),
        }
    }

    pub fn project(files: Vec<SourceFile>, entry_point: impl Into<String>, tier: Tier) -> Self {
        Self {
            code: CodeInput::Files(files),
            entry_point: Some(entry_point.into()),
            ..Self::source(String::new(), tier)
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_client_addr(mut self, addr: IpAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    pub fn with_engine_hint(mut self, engine: Engine) -> Self {
        self.engine_hint = Some(engine);
        self
    }

    pub fn entry_point(&self) -> &str {
        self.entry_point.as_deref().unwrap_or(DEFAULT_ENTRY_POINT)
    }

    /// Files as they will be materialized in the sandbox
    pub fn files(&self) -> Vec<SourceFile> {
        match &self.code {
            CodeInput::Source(code) => vec![SourceFile::new(self.entry_point(), code.clone())],
            CodeInput::Files(files) => files.clone(),
        }
    }

    pub fn is_multi_file(&self) -> bool {
        matches!(&self.code, CodeInput::Files(files) if files.len() > 1)
    }

    pub fn total_size(&self) -> usize {
        match &self.code {
            CodeInput::Source(code) => code.len(),
            CodeInput::Files(files) => files.iter().map(|f| f.content.len()).sum(),
        }
    }

    /// Key used for quotas and ledgers: identity, else `ip:<addr>`
    pub fn identity_key(&self) -> String {
        match (&self.identity, &self.client_addr) {
            (Some(identity), _) if !identity.trim().is_empty() => identity.clone(),
            (_, Some(addr)) => format!("ip:{}", addr),
            _ => "anonymous".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    None,
    ValidationFailed,
    RateLimited,
    Timeout,
    MemoryExceeded,
    ServiceUnavailable,
    InternalError,
}

impl ErrorKind {
    pub fn is_error(&self) -> bool {
        !matches!(self, ErrorKind::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitType {
    Burst,
    Hourly,
    Daily,
    Blocked,
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LimitType::Burst => "burst",
            LimitType::Hourly => "hourly",
            LimitType::Daily => "daily",
            LimitType::Blocked => "blocked",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        };
        f.write_str(name)
    }
}

/// Structured context attached to a failed result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_type: Option<LimitType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The single outbound shape produced once per request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub error_kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub timing_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_peak_kb: Option<u64>,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<Engine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub fallback_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<ErrorDetail>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_deserializes_single_source() {
        let request: ExecutionRequest = serde_json::from_str(
            r#"{"code": "print(1)", "identity": "u1", "tier": "free"}"#,
        )
        .unwrap();

        assert_eq!(request.code, CodeInput::Source("print(1)".to_string()));
        assert_eq!(request.entry_point(), "main.py");
        assert_eq!(request.tier, Tier::Free);
        assert_eq!(request.files(), vec![SourceFile::new("main.py", "print(1)")]);
        assert!(!request.is_multi_file());
    }

    #[test]
    fn test_request_deserializes_project() {
        let request: ExecutionRequest = serde_json::from_str(
            r#"{
                "code": [
                    {"path": "main.py", "content": "import util"},
                    {"path": "util.py", "content": "X = 1"}
                ],
                "entryPoint": "main.py",
                "engineHint": "heavy",
                "identity": null,
                "tier": "paid"
            }"#,
        )
        .unwrap();

        assert!(request.is_multi_file());
        assert_eq!(request.engine_hint, Some(Engine::Heavy));
        assert_eq!(request.total_size(), "import util".len() + "X = 1".len());
    }

    #[test]
    fn test_identity_key_falls_back_to_client_address() {
        let addr: IpAddr = "10.0.0.7".parse().unwrap();
        let anonymous = ExecutionRequest::source("print(1)", Tier::Anonymous).with_client_addr(addr);
        assert_eq!(anonymous.identity_key(), "ip:10.0.0.7");

        let named = anonymous.clone().with_identity("user-42");
        assert_eq!(named.identity_key(), "user-42");

        let blank = anonymous.with_identity("  ");
        assert_eq!(blank.identity_key(), "ip:10.0.0.7");
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let result = ExecutionResult {
            stdout: "2\n".to_string(),
            stderr: String::new(),
            error_kind: ErrorKind::None,
            retry_after_ms: None,
            timing_ms: 12,
            memory_peak_kb: None,
            truncated: false,
            engine: Some(Engine::Light),
            exit_code: Some(0),
            fallback_used: false,
            detail: None,
        };

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["errorKind"], "None");
        assert_eq!(value["timingMs"], 12);
        assert_eq!(value["engine"], "light");
        assert!(value.get("retryAfterMs").is_none());
    }

    #[test]
    fn test_tier_parsing() {
        assert_eq!("PAID".parse::<Tier>().unwrap(), Tier::Paid);
        assert!("gold".parse::<Tier>().is_err());
    }
}
