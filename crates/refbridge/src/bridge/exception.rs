//! Managed exceptions at the foreign boundary.

use std::any::Any;

/// An exception raised by managed code.
///
/// Managed code either returns it as an `Err` or throws it with
/// [`ManagedException::throw`]; the bridge catches both at every boundary
/// crossing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class_name}: {message}")]
pub struct ManagedException {
    /// Fully qualified exception class.
    pub class_name: String,
    /// Exception message.
    pub message: String,
}

impl ManagedException {
    /// Creates an exception of class `class_name`.
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            message: message.into(),
        }
    }

    /// Unwinds with this exception as the panic payload.
    pub fn throw(self) -> ! {
        std::panic::panic_any(self)
    }
}

/// Best-effort description of an unwinding payload the bridge cannot
/// translate.
pub(crate) fn describe_payload(payload: &(dyn Any + Send)) -> String {
    if let Some(exception) = payload.downcast_ref::<ManagedException>() {
        exception.to_string()
    } else if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
