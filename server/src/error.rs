use axum::response::IntoResponse;
use error_stack::Report;
use http::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to build the proxy")]
    BuildingProxy,
    #[error("Failed to start the server")]
    ServerStart,
    #[error("Missing API key")]
    Unauthorized,
    #[error("Invalid API key")]
    InvalidApiKey,
    #[error("Model {0} is not available")]
    ModelHidden(String),
    #[error("Invalid value for time parameter '{0}'")]
    InvalidTimeParam(&'static str),
    #[error("'start' must not be after 'end'")]
    InvalidTimeRange,
    #[error("Failed to read metrics")]
    Metrics,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BuildingProxy | Error::ServerStart => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::InvalidApiKey => StatusCode::FORBIDDEN,
            Error::ModelHidden(_) => StatusCode::FORBIDDEN,
            Error::InvalidTimeParam(_) | Error::InvalidTimeRange => StatusCode::BAD_REQUEST,
            Error::Metrics => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Error::BuildingProxy => "build_proxy",
            Error::ServerStart => "server_start",
            Error::Unauthorized => "unauthorized",
            Error::InvalidApiKey => "invalid_api_key",
            Error::ModelHidden(_) => "model_hidden",
            Error::InvalidTimeParam(_) => "invalid_time_param",
            Error::InvalidTimeRange => "invalid_time_range",
            Error::Metrics => "metrics",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "error": {
                "kind": self.error_kind(),
                "message": self.to_string(),
            }
        });
        (self.status_code(), axum::Json(body)).into_response()
    }
}

/// Wraps a Report and implements IntoResponse, so that route handlers can
/// propagate contextual errors with `?`.
pub struct WrapReport(Report<Error>);

impl From<Report<Error>> for WrapReport {
    fn from(value: Report<Error>) -> Self {
        Self(value)
    }
}

impl From<Error> for WrapReport {
    fn from(value: Error) -> Self {
        Self(Report::new(value))
    }
}

impl IntoResponse for WrapReport {
    fn into_response(self) -> axum::response::Response {
        let error = self.0.current_context();
        if error.status_code().is_server_error() {
            tracing::error!(error = ?self.0, "Request failed");
        }

        let body = serde_json::json!({
            "error": {
                "kind": error.error_kind(),
                "message": error.to_string(),
            }
        });
        (error.status_code(), axum::Json(body)).into_response()
    }
}
