// ABOUTME: Request-shape checks run before admission: size caps, file count and path hygiene
// ABOUTME: Violations surface as ValidationFailed with a `request:*` rule id

use crate::error::{GatewayError, Result};
use crate::settings::RequestLimits;
use crate::types::{CodeInput, ExecutionRequest};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;

lazy_static! {
    /// Relative module paths only: `pkg/util.py`, never `../x.py` or `/etc/x.py`
    static ref FILE_PATH_RE: Regex =
        Regex::new(r"^[A-Za-z0-9_]+(/[A-Za-z0-9_]+)*\.py$").unwrap();
}

pub fn check_shape(request: &ExecutionRequest, limits: &RequestLimits) -> Result<()> {
    if let CodeInput::Files(files) = &request.code {
        if files.is_empty() {
            return Err(GatewayError::request("no_files", "project contains no files"));
        }
        if files.len() > limits.max_files {
            return Err(GatewayError::request(
                "too_many_files",
                format!("{} files exceeds the limit of {}", files.len(), limits.max_files),
            ));
        }
    }

    let files = request.files();
    if request.is_multi_file() {
        if let Some(file) = files
            .iter()
            .find(|f| f.content.len() > limits.per_file_max_bytes)
        {
            return Err(GatewayError::request(
                "file_too_large",
                format!(
                    "{} is {} bytes, limit is {}",
                    file.path,
                    file.content.len(),
                    limits.per_file_max_bytes
                ),
            ));
        }
    } else if request.total_size() > limits.single_file_max_bytes {
        return Err(GatewayError::request(
            "code_too_large",
            format!(
                "source is {} bytes, limit is {}",
                request.total_size(),
                limits.single_file_max_bytes
            ),
        ));
    }

    let mut seen = HashSet::new();
    for file in &files {
        if !FILE_PATH_RE.is_match(&file.path) {
            return Err(GatewayError::request(
                "invalid_path",
                format!("'{}' is not a relative .py path", file.path),
            ));
        }
        if !seen.insert(file.path.as_str()) {
            return Err(GatewayError::request(
                "duplicate_path",
                format!("'{}' appears more than once", file.path),
            ));
        }
    }

    if !seen.contains(request.entry_point()) {
        return Err(GatewayError::request(
            "missing_entry_point",
            format!("entry point '{}' is not among the files", request.entry_point()),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SourceFile, Tier};
    use rstest::rstest;

    fn rule_of(result: Result<()>) -> String {
        match result {
            Err(GatewayError::ValidationFailed { rule_id, .. }) => rule_id,
            other => panic!("expected a request violation, got {:?}", other),
        }
    }

    #[test]
    fn test_single_file_cap_is_inclusive() {
        let limits = RequestLimits::default();
        let at_cap = ExecutionRequest::source("x".repeat(10 * 1024), Tier::Free);
        assert!(check_shape(&at_cap, &limits).is_ok());

        let over = ExecutionRequest::source("x".repeat(10 * 1024 + 1), Tier::Free);
        assert_eq!(rule_of(check_shape(&over, &limits)), "request:code_too_large");
    }

    #[test]
    fn test_multi_file_cap_applies_per_file() {
        let limits = RequestLimits::default();
        let request = ExecutionRequest::project(
            vec![
                SourceFile::new("main.py", "x".repeat(40 * 1024)),
                SourceFile::new("data.py", "y".repeat(40 * 1024)),
            ],
            "main.py",
            Tier::Paid,
        );
        assert!(check_shape(&request, &limits).is_ok());

        let too_big = ExecutionRequest::project(
            vec![
                SourceFile::new("main.py", "import data"),
                SourceFile::new("data.py", "y".repeat(50 * 1024 + 1)),
            ],
            "main.py",
            Tier::Paid,
        );
        assert_eq!(rule_of(check_shape(&too_big, &limits)), "request:file_too_large");
    }

    #[rstest]
    #[case::traversal("../main.py")]
    #[case::absolute("/etc/main.py")]
    #[case::not_python("main.sh")]
    #[case::hidden(".main.py")]
    #[case::empty_segment("pkg//main.py")]
    fn test_rejects_bad_paths(#[case] path: &str) {
        let request =
            ExecutionRequest::project(vec![SourceFile::new(path, "print(1)")], path, Tier::Free);
        assert_eq!(
            rule_of(check_shape(&request, &RequestLimits::default())),
            "request:invalid_path"
        );
    }

    #[test]
    fn test_rejects_duplicates_and_missing_entry() {
        let limits = RequestLimits::default();
        let duplicate = ExecutionRequest::project(
            vec![SourceFile::new("main.py", "a"), SourceFile::new("main.py", "b")],
            "main.py",
            Tier::Free,
        );
        assert_eq!(rule_of(check_shape(&duplicate, &limits)), "request:duplicate_path");

        let missing = ExecutionRequest::project(
            vec![SourceFile::new("app.py", "print(1)")],
            "main.py",
            Tier::Free,
        );
        assert_eq!(rule_of(check_shape(&missing, &limits)), "request:missing_entry_point");

        let empty = ExecutionRequest::project(vec![], "main.py", Tier::Free);
        assert_eq!(rule_of(check_shape(&empty, &limits)), "request:no_files");
    }

    #[test]
    fn test_file_count_limit() {
        let limits = RequestLimits {
            max_files: 2,
            ..RequestLimits::default()
        };
        let files = (0..3)
            .map(|i| SourceFile::new(format!("m{}.py", i), ""))
            .collect();
        let request = ExecutionRequest::project(files, "m0.py", Tier::Free);
        assert_eq!(rule_of(check_shape(&request, &limits)), "request:too_many_files");
    }
}
