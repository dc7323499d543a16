const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Logs and panics with an internal assertion message when the condition is false.
///
/// Used for invariants whose violation means in-memory or persisted state is
/// corrupt. Callers never try to recover from these.
pub fn hard_assert(condition: bool, message: impl AsRef<str>) {
    if !condition {
        fail(message);
    }
}

/// Logs and panics unconditionally.
pub fn fail(message: impl AsRef<str>) -> ! {
    let message = assertion_error(message);
    log::error!("{message}");
    panic!("{message}");
}

/// Builds the string used when raising assertion failures.
pub fn assertion_error(message: impl AsRef<str>) -> String {
    format!(
        "FIRESTORE ({}) INTERNAL ASSERT FAILED: {}",
        SDK_VERSION,
        message.as_ref()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "INTERNAL ASSERT FAILED")]
    fn hard_assert_panics_on_false() {
        hard_assert(false, "should panic");
    }

    #[test]
    fn assertion_error_formats_message() {
        let err = assertion_error("boom");
        assert!(err.contains("FIRESTORE"));
        assert!(err.ends_with("boom"));
    }
}
