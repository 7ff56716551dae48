use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpmError {
    #[error("IO error ({context}): {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Connection timeout")]
    Timeout,
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Configuration rejected: {0}")]
    Configuration(String),
    #[error("Execution failed: {0}")]
    Execution(String),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Cancelled by user")]
    Cancelled,
    #[error("Precondition violated: {0}")]
    Precondition(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Type error: {0}")]
    Type(String),
    #[error("Command mismatch: expected {expected}, got {actual}")]
    CommandMismatch { expected: String, actual: String },
    #[error("Server error {code}: {message}")]
    ServerError { code: i32, message: String },
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

impl SpmError {
    /// Failures that may go away by re-arming the current line.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SpmError::Execution(_) | SpmError::Timeout)
    }

    /// Transport failures that make the remote endpoint unusable.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            SpmError::Io { .. } | SpmError::Connection(_) | SpmError::InvalidAddress(_)
        )
    }
}

impl From<std::io::Error> for SpmError {
    fn from(source: std::io::Error) -> Self {
        SpmError::Io {
            source,
            context: "wire transfer".to_string(),
        }
    }
}
