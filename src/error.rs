use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to decode message payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Persistence failed: {0}")]
    Persistence(anyhow::Error),

    #[error("No post-process handler for record type '{0}'")]
    UnknownRecordType(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Post-processing failed for {kind} record {raw_id}: {cause}")]
    PostProcess {
        kind: String,
        raw_id: i64,
        cause: anyhow::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Panic while consuming: {0}")]
    Panic(String),

    #[error("Exiting after failure (exit_on_exception is set): {0}")]
    ExitRequested(Box<WorkerError>),
}

impl WorkerError {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::Decode(_) => "decode",
            WorkerError::Persistence(_) => "persistence",
            WorkerError::UnknownRecordType(_) => "unknown_record_type",
            WorkerError::Connection(_) => "connection",
            WorkerError::PostProcess { .. } => "post_process",
            WorkerError::Config(_) => "config",
            WorkerError::Panic(_) => "panic",
            WorkerError::ExitRequested(_) => "exit_requested",
        }
    }

    /// Errors that reconnecting cannot fix. The supervisor still backs off on
    /// them; callers can use this to escalate instead.
    pub fn is_configuration_defect(&self) -> bool {
        matches!(
            self,
            WorkerError::UnknownRecordType(_) | WorkerError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
