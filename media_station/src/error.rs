use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::transcode::TranscodeError;

/// Longest slice of transcoder output echoed back to the client.
const DIAGNOSTIC_TAIL: usize = 2048;

/// Errors surfaced by the HTTP handlers. Bodies are plain text.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("No file part")]
    MissingFile,
    #[error("No selected file")]
    EmptyFilename,
    #[error("Invalid file type: {0}. Only video files are supported.")]
    UnsupportedType(String),
    #[error("failed to read upload: {0}")]
    Multipart(String),
    #[error("file not found")]
    NotFound,
    #[error("Video conversion failed.")]
    Conversion(#[source] TranscodeError),
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingFile
            | Self::EmptyFilename
            | Self::UnsupportedType(_)
            | Self::Multipart(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conversion(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(e.into())
    }
}

/// Last `max` bytes of `text`, cut on a char boundary.
fn tail(text: &str, max: usize) -> &str {
    let text = text.trim_end();
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Conversion(e) => match e.diagnostics() {
                Some(diag) => format!("{}\n{}", self, tail(diag, DIAGNOSTIC_TAIL)),
                None => self.to_string(),
            },
            Self::Internal(e) => {
                error!(error = %e, "request failed");
                self.to_string()
            }
            _ => self.to_string(),
        };
        (status, body).into_response()
    }
}
