use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::warn;

use crate::metrics::CALLBACK_FAILURES;

/// Runs a client-supplied callback, swallowing any panic it raises.
/// Returns whether the callback completed.
pub(crate) fn deliver(name: &'static str, f: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(_) => {
            CALLBACK_FAILURES.with_label_values(&[name]).inc();
            warn!(callback = name, "client callback panicked; ignoring");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn panicking_callback_reports_failure() {
        assert!(deliver("ok", || {}));
        assert!(!deliver("boom", || panic!("client bug")));
    }
}
