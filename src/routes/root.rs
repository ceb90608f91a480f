use std::sync::Arc;

use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::state::AppState;

pub async fn get(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "deployment": state.registry.current(),
    }))
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use test_log::test;

    use crate::{
        deployments::FileEntry,
        tests::{AppFixture, body_json},
    };

    #[test(tokio::test)]
    pub async fn get() -> Result<()> {
        let fixture = AppFixture::new().await?;

        let res = fixture
            .request(Request::builder().uri("/").body(Body::empty())?)
            .await?;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(body_json(res).await?["deployment"].is_null());

        let deployment = fixture
            .state()
            .build(&[FileEntry::new("index.sh", "true")])
            .await?;

        let res = fixture
            .request(Request::builder().uri("/").body(Body::empty())?)
            .await?;
        assert_eq!(body_json(res).await?["deployment"], deployment.to_string());

        // Responses carry a request id
        let res = fixture
            .request(Request::builder().uri("/").body(Body::empty())?)
            .await?;
        assert!(res.headers().contains_key("x-request-id"));

        fixture.teardown().await
    }
}
