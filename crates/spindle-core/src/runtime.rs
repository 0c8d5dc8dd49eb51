use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::domain::TaskBody;
use crate::error::TaskFailure;

/// Run one task body on the current thread.
///
/// Both returned errors and panics come back as a `TaskFailure`, so nothing
/// the body does can unwind into the caller.
pub fn execute<T>(body: TaskBody<T>) -> Result<T, TaskFailure> {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        Err(payload) => Err(TaskFailure::Panicked {
            message: panic_message(payload.as_ref()),
        }),
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
