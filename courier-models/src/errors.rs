use std::fmt;

pub type SendableError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug)]
pub struct RuntimeError {
    code: String,
    message: String,
}

impl RuntimeError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// Wrap any error into a coded [`RuntimeError`] suitable for returning from `main`.
pub fn runtime_error(code: &str, err: impl fmt::Display) -> SendableError {
    Box::new(RuntimeError::new(code, err.to_string()))
}
