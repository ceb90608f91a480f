use std::{collections::BTreeMap, sync::Arc};

use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header},
    response::Response,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Error, Result},
    loader::EntryPoint,
    state::AppState,
};

/// What `handleHttpRequest` sees of an inbound request.
#[derive(Debug, Serialize)]
struct HttpRequestPayload {
    method: String,
    path: String,
    query: Option<String>,
    headers: BTreeMap<String, String>,
    body: String,
}

/// What `handleHttpRequest` answers with. A string body is sent as is, anything else as JSON.
#[derive(Debug, Default, Deserialize)]
struct LogicResponse {
    status: Option<u16>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Value,
}

fn invalid(reason: String) -> Error {
    Error::ModuleLoadFailure(format!("handleHttpRequest returned {reason}"))
}

pub(crate) async fn handle(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let mut flattened: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            flattened
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }
    }

    let payload = serde_json::to_value(HttpRequestPayload {
        method: method.to_string(),
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers: flattened,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
    .context("Failed to encode request")?;

    let reply = state
        .dispatch(EntryPoint::HandleHttpRequest, &payload)
        .await?;

    into_response(reply)
}

fn into_response(reply: Value) -> Result<Response> {
    let reply: LogicResponse = match reply {
        Value::Null => LogicResponse::default(),
        reply => serde_json::from_value(reply)
            .map_err(|err| invalid(format!("an invalid response: {err}")))?,
    };

    let status = StatusCode::from_u16(reply.status.unwrap_or(200))
        .map_err(|err| invalid(format!("an invalid status: {err}")))?;

    let mut builder = Response::builder().status(status);

    let (body, is_json) = match reply.body {
        Value::Null => (String::new(), false),
        Value::String(body) => (body, false),
        other => (other.to_string(), true),
    };

    if is_json
        && !reply
            .headers
            .keys()
            .any(|name| name.eq_ignore_ascii_case(header::CONTENT_TYPE.as_str()))
    {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
    }

    for (name, value) in reply.headers {
        let name = HeaderName::try_from(name.as_str())
            .map_err(|err| invalid(format!("an invalid header name {name:?}: {err}")))?;
        let value = HeaderValue::try_from(value.as_str())
            .map_err(|err| invalid(format!("an invalid value for {name}: {err}")))?;
        builder = builder.header(name, value);
    }

    Ok(builder
        .body(Body::from(body))
        .context("Failed to build response")?)
}
