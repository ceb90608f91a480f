use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{any, get, post},
};

use crate::state::AppState;

mod chat;
mod deploy;
mod root;
mod showdown;

pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.body_limit;

    Router::new()
        .route("/", get(root::get))
        .route("/deploy", post(deploy::post))
        .route("/chat/interactions", post(chat::interaction))
        .route("/chat/messages", post(chat::message))
        .route("/showdown", any(showdown::handle))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
