//! Shared helpers for in-crate tests.

/// Proptest case count, overridable through `PROPTEST_CASES` for longer
/// fuzzing runs in CI.
pub fn proptest_cases(default: u32) -> u32 {
    std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
