//! A retain/release object system in the style of Objective-C.

use parking_lot::Mutex;

use super::exception::ManagedException;
use super::{ForeignObjectSystem, ForeignWrapper};

/// Error object handed to retain/release callers, modelled on `NSError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignErrorObject {
    /// Error domain.
    pub domain: String,
    /// Error code within the domain.
    pub code: i64,
    /// Human-readable description.
    pub description: String,
    /// The managed exception this error was translated from, if any.
    pub exception: Option<ManagedException>,
}

/// Retain/release object system.
///
/// Managed exceptions become [`ForeignErrorObject`]s. If a set of declared
/// exception classes is configured, only those are translated; anything
/// else cannot cross the boundary and terminates the process.
#[derive(Debug)]
pub struct RetainReleaseSystem {
    domain: String,
    declared: Vec<String>,
    deallocated: Mutex<Vec<ForeignWrapper>>,
}

impl RetainReleaseSystem {
    /// Creates a system that translates every managed exception into an
    /// error in `domain`.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            declared: Vec::new(),
            deallocated: Mutex::new(Vec::new()),
        }
    }

    /// Restricts translation to the given exception classes.
    #[must_use]
    pub fn with_declared_exceptions<I, C>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        self.declared.extend(classes.into_iter().map(Into::into));
        self
    }

    /// Wrappers deallocated so far, in order.
    pub fn deallocated(&self) -> Vec<ForeignWrapper> {
        self.deallocated.lock().clone()
    }

    fn is_declared(&self, class_name: &str) -> bool {
        self.declared.is_empty() || self.declared.iter().any(|c| c == class_name)
    }
}

impl ForeignObjectSystem for RetainReleaseSystem {
    type Error = ForeignErrorObject;

    fn name(&self) -> &'static str {
        "retain-release"
    }

    fn wrapper_deallocated(&self, wrapper: ForeignWrapper) {
        self.deallocated.lock().push(wrapper);
    }

    fn exception_to_error(&self, exception: &ManagedException) -> Option<ForeignErrorObject> {
        self.is_declared(&exception.class_name)
            .then(|| ForeignErrorObject {
                domain: self.domain.clone(),
                code: 0,
                description: exception.to_string(),
                exception: Some(exception.clone()),
            })
    }

    fn error_to_exception(&self, error: ForeignErrorObject) -> ManagedException {
        error.exception.unwrap_or_else(|| {
            ManagedException::new(
                "ForeignException",
                format!("{} ({}): {}", error.domain, error.code, error.description),
            )
        })
    }
}
