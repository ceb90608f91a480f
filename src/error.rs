use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::digest::Digest;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid deploy token")]
    Unauthorized,
    #[error("malformed request: {0}")]
    InvalidRequest(String),
    #[error("missing data for hash {digest}")]
    MissingBlobData { digest: Digest },
    #[error("content supplied for {digest} does not match its digest")]
    CorruptBlob { digest: Digest },
    #[error("{0:?} is not a lowercase hex sha256 digest")]
    InvalidDigest(String),
    #[error("{0:?} is not a relative path inside the deployment")]
    InvalidFilename(String),
    #[error("a deployment needs at least one file")]
    EmptyDeployment,
    #[error("{filename} already exists in deployment {deployment} with different content")]
    LinkConflict { deployment: Digest, filename: String },
    #[error("blob {digest} not found")]
    BlobNotFound { digest: Digest },
    #[error("no deployment has been published yet")]
    NoDeploymentAvailable,
    #[error("deployed logic failed: {0}")]
    ModuleLoadFailure(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Unhandled(#[from] anyhow::Error),
}

fn format_error(e: &dyn std::error::Error) -> String {
    let mut s = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        s.push_str(&format!("\nCaused by: {}", cause));
        source = cause.source();
    }
    s
}

fn simple_error(status: StatusCode, code: &str, message: String) -> Response {
    let body = serde_json::json!({
        "errors": [{
            "code": code,
            "message": message
        }]
    });

    (status, Json(body)).into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match self {
            Self::Unauthorized => simple_error(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message),
            Self::InvalidRequest(_) => {
                simple_error(StatusCode::BAD_REQUEST, "REQUEST_INVALID", message)
            }
            Self::MissingBlobData { .. } => {
                simple_error(StatusCode::BAD_REQUEST, "BLOB_DATA_MISSING", message)
            }
            Self::CorruptBlob { .. } | Self::InvalidDigest(_) => {
                simple_error(StatusCode::BAD_REQUEST, "DIGEST_INVALID", message)
            }
            Self::InvalidFilename(_) => {
                simple_error(StatusCode::BAD_REQUEST, "FILENAME_INVALID", message)
            }
            Self::EmptyDeployment => {
                simple_error(StatusCode::BAD_REQUEST, "DEPLOYMENT_EMPTY", message)
            }
            Self::LinkConflict { .. } => {
                simple_error(StatusCode::CONFLICT, "DEPLOYMENT_CONFLICT", message)
            }
            Self::NoDeploymentAvailable => {
                simple_error(StatusCode::SERVICE_UNAVAILABLE, "NO_DEPLOYMENT", message)
            }
            Self::ModuleLoadFailure(_) => {
                error!(error = %message, "Deployed logic failed");
                simple_error(StatusCode::BAD_GATEWAY, "LOGIC_FAILED", message)
            }
            err @ (Self::BlobNotFound { .. } | Self::Io(_) | Self::Unhandled(_)) => {
                error!(error = %format_error(&err), "Unhandled error");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}
