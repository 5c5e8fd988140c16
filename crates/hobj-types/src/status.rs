use std::fmt;

use crate::status_code::{self, ChunkSelectorCode, ErrorClass, StatusCode, status_code_t};

/// Error value returned by every fallible chunk-layer call: a numeric code
/// from [`crate::status_code`] plus an optional detail message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Status {
    code: status_code_t,
    message: Option<String>,
}

pub type Result<T> = std::result::Result<T, Status>;

impl Status {
    pub fn new(code: status_code_t) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn with_message(code: status_code_t, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(msg.into()),
        }
    }

    pub fn code(&self) -> status_code_t {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::OK
    }

    /// The taxonomy bucket of the code: not found, no space, invalid state
    /// and so on. Callers branch on this rather than on raw codes.
    pub fn class(&self) -> ErrorClass {
        status_code::error_class(self.code)
    }

    /// Whether the call failed only because capacity ran out; such calls can
    /// be retried against another PG or device.
    pub fn is_no_space(&self) -> bool {
        self.code == ChunkSelectorCode::NO_SPACE
    }

    /// `Name(code) message`, e.g. `ChunkSelector::UnknownPg(12001) pg 7`.
    pub fn describe(&self) -> String {
        let name = status_code::to_string(self.code);
        match &self.message {
            Some(msg) => format!("{}({}) {}", name, self.code, msg),
            None => format!("{}({})", name, self.code),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl std::error::Error for Status {}

impl From<status_code_t> for Status {
    fn from(code: status_code_t) -> Self {
        Self::new(code)
    }
}

pub fn make_error<T>(code: status_code_t) -> Result<T> {
    Err(Status::new(code))
}

pub fn make_error_msg<T>(code: status_code_t, msg: impl Into<String>) -> Result<T> {
    Err(Status::with_message(code, msg))
}
