//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! across the gateway workspace:
//! - No sleep() calls in production code
//! - No unwrap()/expect() in production code
//! - No process-global engine state
//!
//! The helpers here locate production sources and strip test code so each
//! rule only sees what ships.

use std::fs;
use std::path::{Path, PathBuf};

/// Source trees scanned by the rules, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["gateway/core/src", "gateway/daemon/src"];

/// Files compiled only under `cfg(test)`
const TEST_ONLY_FILES: &[&str] = &["test_utils.rs"];

/// One rule violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: PathBuf,
    pub line: usize,
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.text)
    }
}

/// Workspace root, two levels above this crate
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// Every production `.rs` file with its contents
pub fn production_sources() -> Vec<(PathBuf, String)> {
    let root = workspace_root();
    let mut sources = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let file = entry.path();
            if file.extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let name = file.file_name().and_then(|s| s.to_str()).unwrap_or("");
            if TEST_ONLY_FILES.contains(&name) {
                continue;
            }
            if let Ok(content) = fs::read_to_string(file) {
                sources.push((file.to_path_buf(), content));
            }
        }
    }
    sources
}

/// Production lines of a file as `(line_number, code)`, comments stripped
///
/// A `#[cfg(test)]` item ending in `;` is skipped on its own; any other
/// `#[cfg(test)]` item is a test module and ends the production part of the
/// file, matching the layout used across the workspace.
pub fn production_lines(content: &str) -> Vec<(usize, String)> {
    let lines: Vec<&str> = content.lines().collect();
    let mut out = Vec::new();
    let mut idx = 0;

    while idx < lines.len() {
        let trimmed = lines[idx].trim();
        if trimmed.starts_with("#[cfg(test)]") {
            let next = lines[idx + 1..].iter().position(|l| !l.trim().is_empty());
            match next {
                Some(offset) if lines[idx + 1 + offset].trim_end().ends_with(';') => {
                    idx += offset + 2;
                    continue;
                }
                _ => break,
            }
        }

        let code = lines[idx].split("//").next().unwrap_or("");
        if !code.trim().is_empty() {
            out.push((idx + 1, code.to_string()));
        }
        idx += 1;
    }
    out
}

/// Scan all production lines with `matches`
pub fn scan(matches: impl Fn(&str) -> bool) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (path, content) in production_sources() {
        for (line, code) in production_lines(&content) {
            if matches(&code) {
                violations.push(Violation {
                    path: path.clone(),
                    line,
                    text: code.trim().to_string(),
                });
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let src = "fn a() {}\n// note\n#[cfg(test)]\nmod tests {\n    fn b() { x.unwrap(); }\n}\n";
        let lines = production_lines(src);
        assert_eq!(lines, vec![(1, "fn a() {}".to_string())]);
    }

    #[test]
    fn test_production_lines_skip_test_only_declaration() {
        let src = "pub mod a;\n#[cfg(test)]\npub mod test_utils;\npub use a::A;\n";
        let lines: Vec<usize> = production_lines(src).into_iter().map(|(n, _)| n).collect();
        assert_eq!(lines, vec![1, 4]);
    }

    #[test]
    fn test_workspace_root_has_sources() {
        assert!(!production_sources().is_empty());
    }
}
