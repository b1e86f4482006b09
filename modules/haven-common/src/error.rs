use thiserror::Error;

#[derive(Error, Debug)]
pub enum HavenError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Scheduling error: {0}")]
    Scheduling(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
