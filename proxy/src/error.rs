#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("No usable credentials were configured")]
    NoCredentials,
    #[error("Credential {0} could not be parsed")]
    InvalidCredential(String),
    #[error("Failed to read configuration file")]
    ReadingConfig,
    #[error("Failed to initialize the metrics database")]
    InitDatabase,
    #[error("Failed to write to the metrics store")]
    WritingMetrics,
    #[error("Failed to read from the metrics store")]
    ReadingMetrics,
}
