use std::sync::Arc;

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use axum_extra::TypedHeader;
use headers::{Authorization, authorization::Bearer};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{deployments::FileEntry, error::Error, state::AppState};

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    #[serde(default)]
    token: Option<String>,
    files: Vec<DeployFile>,
}

/// Digests stay plain strings until the caller is authenticated.
#[derive(Debug, Deserialize)]
pub struct DeployFile {
    filename: String,
    #[serde(alias = "digest")]
    hash: String,
    #[serde(default, alias = "content")]
    data: Option<String>,
}

impl TryFrom<DeployFile> for FileEntry {
    type Error = Error;

    fn try_from(file: DeployFile) -> Result<Self, Self::Error> {
        Ok(FileEntry {
            filename: file.filename,
            digest: file.hash.parse()?,
            content: file.data,
        })
    }
}

pub(crate) async fn post(
    State(state): State<Arc<AppState>>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    request: Result<Json<DeployRequest>, JsonRejection>,
) -> Result<Json<Value>, Error> {
    let Json(DeployRequest { token, files }) =
        request.map_err(|rejection| Error::InvalidRequest(rejection.body_text()))?;

    let token = token
        .as_deref()
        .or_else(|| bearer.as_ref().map(|TypedHeader(header)| header.token()));
    state.check_token(token)?;

    let files = files
        .into_iter()
        .map(FileEntry::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    let deployment = state.build(&files).await?;

    Ok(Json(json!({ "deployment": deployment })))
}
