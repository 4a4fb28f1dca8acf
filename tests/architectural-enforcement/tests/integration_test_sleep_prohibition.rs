//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in the gateway core and daemon MUST NOT call
//! sleep methods. Periodic work uses `tokio::time::interval()`; waiting on a
//! breaker timeout is a clock comparison, never a sleep.
//!
//! **Exceptions**: test code (`#[cfg(test)]` modules and `tests/` directories).

use architectural_enforcement::scan;

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations = scan(|code| code.contains("::sleep(") || code.contains(".sleep("));

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n✅ ACCEPTABLE alternatives:");
        eprintln!("  - Periodic tasks using tokio::time::interval()");
        eprintln!("  - Waiting on CancellationToken::cancelled()");
        eprintln!("  - Comparing Clock::now() against a deadline");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

/// Breaker timing must go through the injectable clock
#[test]
fn test_no_direct_instant_now_in_breaker() {
    let violations: Vec<_> = scan(|code| code.contains("Instant::now()"))
        .into_iter()
        .filter(|v| v.path.ends_with("breaker.rs") || v.path.ends_with("failover.rs"))
        .collect();

    assert!(
        violations.is_empty(),
        "Breaker and failover code must read time through Clock:\n{}",
        violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    );
}
