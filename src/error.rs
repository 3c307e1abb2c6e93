use http::StatusCode;
use thiserror::Error;

use crate::models::VideoId;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage io error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ApiError {
    /// The access token was rejected and the refresh round trip failed too.
    /// Persisted tokens are already cleared when this is returned.
    #[error("authentication expired")]
    AuthExpired,
    #[error("request failed with status {status}")]
    Status {
        status: StatusCode,
        body: serde_json::Value,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("invalid url: {0}")]
    Url(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ApiError::AuthExpired)
            || self.status() == Some(StatusCode::UNAUTHORIZED)
    }

    /// Human-readable message carried by an error payload: `detail` first,
    /// then the first `non_field_errors` entry.
    pub fn user_message(&self) -> Option<String> {
        let ApiError::Status { body, .. } = self else {
            return None;
        };
        if let Some(detail) = body.get("detail").and_then(|d| d.as_str()) {
            return Some(detail.to_string());
        }
        body.get("non_field_errors")
            .and_then(|v| v.as_array())
            .and_then(|list| list.first())
            .and_then(|first| first.as_str())
            .map(str::to_string)
    }
}

#[derive(Error, Debug)]
pub enum QuizError {
    #[error("{0}")]
    Ineligible(String),
    #[error("no questions available for video {0}")]
    NoQuestions(VideoId),
    #[error("question {0} is not part of this quiz")]
    UnknownQuestion(i64),
    #[error("there is no question at position {0}")]
    NoSuchPosition(usize),
    #[error("answer {answer} does not belong to question {question}")]
    UnknownAnswer { question: i64, answer: i64 },
    #[error("the quiz is not waiting on the video")]
    NotWatching,
    #[error("quiz is not accepting answers")]
    NotAnswering,
    #[error("quiz is already being submitted")]
    AlreadySubmitting,
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("all active videos must be passed ({passed}/{total})")]
    NotEligible { passed: usize, total: usize },
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("failed to write certificate: {0}")]
    Io(#[from] std::io::Error),
}
