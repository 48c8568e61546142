const ASSERT_PREFIX: &str = "FIRESTORE SYNC INTERNAL ASSERT FAILED";

/// Logs and panics when an internal invariant does not hold.
pub fn hard_assert(condition: bool, message: impl AsRef<str>) {
    if !condition {
        fail(message);
    }
}

/// Unconditional invariant failure. Always logged before unwinding.
pub fn fail(message: impl AsRef<str>) -> ! {
    let text = assertion_error(message);
    log::error!("{text}");
    panic!("{text}");
}

pub fn assertion_error(message: impl AsRef<str>) -> String {
    format!(
        "{ASSERT_PREFIX} ({}): {}",
        env!("CARGO_PKG_VERSION"),
        message.as_ref()
    )
}
