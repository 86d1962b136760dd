use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// A failure raised by user-supplied logic, whether it returned an error or panicked.
#[derive(Debug)]
pub enum Fault {
    Error(anyhow::Error),
    Panic(String),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Error(err) => write!(f, "{err:#}"),
            Fault::Panic(msg) => write!(f, "panicked: {msg}"),
        }
    }
}

/// Runs a hook so that neither an `Err` nor a panic escapes to the caller.
pub fn isolate<T>(hook: impl FnOnce() -> anyhow::Result<T>) -> Result<T, Fault> {
    match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(Fault::Error(err)),
        Err(payload) => Err(Fault::Panic(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn passes_values_through() {
        assert_eq!(isolate(|| Ok(7)).unwrap(), 7);
    }

    #[test]
    fn captures_errors_and_panics() {
        let err = isolate::<()>(|| Err(anyhow!("boom"))).unwrap_err();
        assert!(matches!(err, Fault::Error(_)));
        assert_eq!(err.to_string(), "boom");

        let panic = isolate::<()>(|| panic!("exploded {}", 3)).unwrap_err();
        assert!(matches!(panic, Fault::Panic(ref msg) if msg == "exploded 3"));
    }
}
