//! Integration Test: Error Propagation and Global State
//!
//! **Policy**:
//! - Production code propagates errors with `?`; `unwrap()` and `expect()`
//!   are reserved for tests.
//! - The routing engine is built by the composition root and passed around
//!   explicitly; no process-global instance or lazily initialised static.

use architectural_enforcement::{scan, Violation};

fn report(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("  ❌ {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[test]
fn test_no_unwrap_or_expect_in_production_code() {
    let violations = scan(|code| code.contains(".unwrap()") || code.contains(".expect("));

    assert!(
        violations.is_empty(),
        "\nFound {} unwrap()/expect() call(s) in production code:\n{}\n\
         Propagate with `?` or handle the None/Err case explicitly.",
        violations.len(),
        report(&violations)
    );
}

#[test]
fn test_no_global_state_in_production_code() {
    let violations = scan(|code| {
        let code = code.trim_start();
        let is_static = code.starts_with("static ") || code.starts_with("pub static ");
        is_static
            && ["Lazy", "OnceLock", "OnceCell", "Mutex", "RwLock", "lazy_static"]
                .iter()
                .any(|marker| code.contains(marker))
    });

    let lazy_macro = scan(|code| code.contains("lazy_static!"));

    assert!(
        violations.is_empty() && lazy_macro.is_empty(),
        "\nProcess-global state found in production code:\n{}\n{}",
        report(&violations),
        report(&lazy_macro)
    );
}
