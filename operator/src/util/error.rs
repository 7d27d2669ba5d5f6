#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    /// Unknown timezone, a DAG cycle that slipped past admission, an
    /// unresolved connector reference — mark the plan Error, no retries
    /// until the spec changes.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Restore-store I/O failure; transient, propagated as a requeue.
    #[error("Restore storage error: {0}")]
    Storage(String),

    #[error("Failed to parse DateTime: {source}")]
    Chrono {
        #[from]
        source: chrono::ParseError,
    },

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Parse duration: {source}")]
    ParseDuration {
        #[from]
        source: parse_duration::parse::Error,
    },
}
