use std::sync::Arc;

use axum::{Json, extract::State};
use serde_json::Value;

use crate::{error::Error, loader::EntryPoint, state::AppState};

pub(crate) async fn interaction(
    State(state): State<Arc<AppState>>,
    Json(interaction): Json<Value>,
) -> Result<Json<Value>, Error> {
    let reply = state
        .dispatch(EntryPoint::HandleInteraction, &interaction)
        .await?;
    Ok(Json(reply))
}

pub(crate) async fn message(
    State(state): State<Arc<AppState>>,
    Json(message): Json<Value>,
) -> Result<Json<Value>, Error> {
    let reply = state.dispatch(EntryPoint::HandleMessage, &message).await?;
    Ok(Json(reply))
}
