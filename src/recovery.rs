//! Fault-isolation boundary around collaborator code
//!
//! Consumer fan-out and sink calls run arbitrary code on the arbiter and
//! collector threads. A panic there is caught, logged, and turned into `None`
//! so the calling loop keeps going.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Run `f`, catching any panic it raises
///
/// `boundary` names the call site in the log line.
pub fn with_recovery<F, R>(boundary: &str, f: F) -> Option<R>
where
    F: FnOnce() -> R,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            tracing::error!(
                boundary,
                panic = %panic_message(payload.as_ref()),
                "recovered panic"
            );
            None
        }
    }
}

/// Best-effort extraction of a panic payload as text
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
