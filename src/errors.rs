/// Errors surfaced by the cookie store.
///
/// Recoverable conditions while loading (missing file, corrupt JSON, a single
/// undecodable record) are logged and never turned into a `StoreError`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid store configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Blocking operation '{0}' is not supported on a worker-backed store")]
    BlockingInWorkerMode(&'static str),

    #[error("Cookie store worker terminated")]
    WorkerTerminated,

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Unexpected worker response for '{0}'")]
    UnexpectedResponse(&'static str),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: StoreError = io.into();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn blocking_error_names_the_operation() {
        let err = StoreError::BlockingInWorkerMode("put_cookie");
        assert_eq!(
            err.to_string(),
            "Blocking operation 'put_cookie' is not supported on a worker-backed store"
        );
    }
}
