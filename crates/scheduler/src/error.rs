/// Shared error type used across the scheduler crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job already exists: {0}")]
    DuplicateJob(String),

    #[error("collaborator not configured: {0}")]
    MissingCollaborator(&'static str),

    #[error("scheduler degraded: {0}")]
    Degraded(String),

    #[error("config file unreadable; refusing to rewrite: {0}")]
    ConfigPoisoned(String),

    #[error("scheduler is not running")]
    NotRunning,

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
