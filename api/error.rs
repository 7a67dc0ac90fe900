use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    /// The caller does not hold the lease on the job it tried to mutate.
    #[error("job is not owned by this worker")]
    NotOwned,

    #[error("job is already active: {id}")]
    AlreadyActive { queue: String, key: String, id: String },

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Queue(relay_queues::Error),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    detail: String,
}

impl From<relay_queues::Error> for ApiError {
    fn from(err: relay_queues::Error) -> ApiError {
        match err {
            relay_queues::Error::NotFound(_) => ApiError::NotFound,
            relay_queues::Error::AlreadyActive { queue, key, id } => {
                ApiError::AlreadyActive { queue, key, id }
            }
            relay_queues::Error::Validation(msg) | relay_queues::Error::InvalidCron(_, msg) => {
                ApiError::Validation(msg)
            }
            other => ApiError::Queue(other),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound | ApiError::NotOwned => StatusCode::NOT_FOUND,
            ApiError::AlreadyActive { .. } => StatusCode::CONFLICT,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let error = match self {
            ApiError::NotFound => "not_found",
            ApiError::NotOwned => "not_owned",
            ApiError::AlreadyActive { .. } => "already_active",
            ApiError::Validation(_) => "validation",
            ApiError::Queue(_) => "internal",
        };
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error,
            detail: self.to_string(),
        })
    }
}
