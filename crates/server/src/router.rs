//! HTTP router construction.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api;
use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/workers", get(api::workers))
        .route("/runs", get(api::list_runs).post(api::submit_run))
        .route("/runs/{id}", get(api::get_run).delete(api::cancel_run))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use exgraf_compute::{Coordinator, RunRegistry, SchedulerConfig};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    fn app() -> Router {
        let coordinator = Coordinator::new(SchedulerConfig::default()).unwrap();
        build_router(Arc::new(AppState {
            runs: RunRegistry::new(Arc::new(coordinator)),
            workers: None,
        }))
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn relu_graph() -> Value {
        json!({
            "nodes": [
                {"id": 1, "op": {"placeholder": {"name": "x"}}, "shape": {"rows": 1, "cols": 3}},
                {"id": 2, "op": "relu", "inputs": [1]}
            ],
            "outputs": [2]
        })
    }

    fn x() -> Value {
        json!({"shape": {"rows": 1, "cols": 3}, "data": [-1.0, 0.5, 2.0]})
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, body) = call(&app(), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["live_workers"], 0);
    }

    #[tokio::test]
    async fn submit_and_poll_until_succeeded() {
        let app = app();
        let (status, body) = call(
            &app,
            post("/runs", json!({"graph": relu_graph(), "feeds": {"x": x()}})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id = body["id"].as_str().unwrap().to_string();

        let mut last = Value::Null;
        for _ in 0..100 {
            let (status, body) = call(&app, get(&format!("/runs/{id}"))).await;
            assert_eq!(status, StatusCode::OK);
            if body["status"] != "running" {
                last = body;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(last["status"], "succeeded");
        assert_eq!(last["outputs"][0][0], 2);
        assert_eq!(last["outputs"][0][1]["data"], json!([0.0, 0.5, 2.0]));

        let (_, list) = call(&app, get("/runs")).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_feed_is_bad_request() {
        let (status, body) = call(&app(), post("/runs", json!({"graph": relu_graph()}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "missing_feed");
    }

    #[tokio::test]
    async fn cyclic_graph_is_bad_request() {
        let graph = json!({
            "nodes": [
                {"id": 1, "op": "relu", "inputs": [2]},
                {"id": 2, "op": "neg", "inputs": [1]}
            ],
            "outputs": [2]
        });
        let (status, body) = call(&app(), post("/runs", json!({"graph": graph}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "cycle_detected");
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let app = app();
        let id = uuid::Uuid::new_v4();
        let (status, _) = call(&app, get(&format!("/runs/{id}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let delete = Request::delete(format!("/runs/{id}")).body(Body::empty()).unwrap();
        let (status, _) = call(&app, delete).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
