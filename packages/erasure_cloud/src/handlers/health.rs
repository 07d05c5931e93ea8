use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::AppState;

/// Liveness check - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

/// Readiness check - returns 200 if the shared database answers
pub async fn health_ready_handler(State(state): State<AppState>) -> Response {
    let db_ok = state.db.store.ping().await.is_ok();

    if db_ok {
        Json(serde_json::json!({
            "status": "ready",
            "database": "connected"
        }))
        .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected"
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request, routing::get};
    use tower::ServiceExt;

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_live() {
        let app: Router = Router::new().route("/health/live", get(health_live_handler));
        let resp = app
            .oneshot(Request::builder().uri("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "alive");
    }

    #[tokio::test]
    async fn test_ready_and_not_ready() {
        let (state, _tmp) = crate::test_helpers::test_app_state().await;
        let store = state.db.store.clone();
        let app = Router::new()
            .route("/health/ready", get(health_ready_handler))
            .with_state(state);

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["database"], "connected");

        store.close().await;
        let resp = app
            .oneshot(Request::builder().uri("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
