use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use xchat_core::{ChatService, Components, XchatConfig};
use xchat_http::{build_router, AppState, USER_ID_HEADER};
use xchat_infer::KeywordLlmEngine;
use xchat_ledger::{MemorySink, NullSink};
use xchat_store::{demo_corpus, demo_source, InMemoryDataSource};

async fn app_with(latency: Duration) -> (Router, Arc<InMemoryDataSource>) {
    let tables = Arc::new(demo_source(latency).await);
    let service = ChatService::spawn(
        Components {
            source: tables.clone(),
            llm: Arc::new(KeywordLlmEngine::new()),
            retriever: Arc::new(demo_corpus()),
            sink: Arc::new(NullSink),
        },
        &XchatConfig::default(),
    );
    let router = build_router(AppState {
        service,
        tables: Some(tables.clone()),
    });
    (router, tables)
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri).header(USER_ID_HEADER, "u-42");
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn healthz_is_ok() {
    let (app, _) = app_with(Duration::ZERO).await;
    let (status, _) = call(&app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn filter_order_does_not_defeat_the_cache() {
    let (app, tables) = app_with(Duration::ZERO).await;
    let first = json!({
        "raw_data_source": "sales_table",
        "columns": ["Date", "Product A"],
        "filters": [
            {"column": "Product A", "op": "gt", "value": 55},
            {"column": "Product B", "op": "lt", "value": 100}
        ]
    });
    let second = json!({
        "raw_data_source": "sales_table",
        "columns": ["Date", "Product A"],
        "filters": [
            {"column": "Product B", "op": "lt", "value": 100},
            {"column": "Product A", "op": "gt", "value": 55}
        ]
    });

    let (status, a) = call(&app, "POST", "/v1/data/fetch", Some(first)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(a["from_cache"], false);

    let (status, b) = call(&app, "POST", "/v1/data/fetch", Some(second)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(b["from_cache"], true);
    assert_eq!(a["records"], b["records"]);
    assert_eq!(tables.fetch_count(), 1);

    let (_, stats) = call(&app, "GET", "/v1/cache/stats", None).await;
    assert_eq!(stats["hits"], 1);
    assert_eq!(stats["entries"], 1);
}

#[tokio::test]
async fn replacing_a_source_forces_a_refetch() {
    let (app, _) = app_with(Duration::ZERO).await;
    let query = json!({"raw_data_source": "sales_table", "columns": ["Product C"], "limit": 3});

    call(&app, "POST", "/v1/data/fetch", Some(query.clone())).await;
    let (status, body) = call(
        &app,
        "PUT",
        "/v1/data/sources/sales_table",
        Some(json!({"records": [{"Product C": 1.5}]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["freshness_token"].is_u64());

    let (_, fresh) = call(&app, "POST", "/v1/data/fetch", Some(query)).await;
    assert_eq!(fresh["from_cache"], false);
    assert_eq!(fresh["records"], json!([{"Product C": 1.5}]));
}

#[tokio::test]
async fn emptied_source_answers_with_no_rows() {
    let (app, _) = app_with(Duration::ZERO).await;
    let (status, _) = call(
        &app,
        "PUT",
        "/v1/data/sources/sales_table",
        Some(json!({"records": []})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(
        &app,
        "POST",
        "/v1/data/fetch",
        Some(json!({"raw_data_source": "sales_table", "columns": ["Date", "Product A"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["records"], json!([]));

    let (status, _) = call(
        &app,
        "PUT",
        "/v1/data/sources/returns",
        Some(json!({"records": [], "columns": ["Date", "Units"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(
        &app,
        "POST",
        "/v1/data/fetch",
        Some(json!({"raw_data_source": "returns", "columns": ["Units"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["records"], json!([]));
}

#[tokio::test]
async fn bad_descriptors_are_400() {
    let (app, _) = app_with(Duration::ZERO).await;
    let (status, body) = call(
        &app,
        "POST",
        "/v1/data/fetch",
        Some(json!({"raw_data_source": "sales_table", "columns": ["Revenue"]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "InvalidDescriptor");

    let (status, body) = call(
        &app,
        "POST",
        "/v1/data/fetch",
        Some(json!({"raw_data_source": "sales_table", "filters": [{"column": "Date", "op": "regex", "value": "x"}]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "InvalidDescriptor");
}

#[tokio::test]
async fn offline_source_is_503() {
    let (app, tables) = app_with(Duration::ZERO).await;
    tables.set_offline(true);
    let (status, body) = call(
        &app,
        "POST",
        "/v1/data/fetch",
        Some(json!({"raw_data_source": "sales_table"})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "SourceUnavailable");
}

#[tokio::test]
async fn chart_config_mismatch_is_400() {
    let (app, _) = app_with(Duration::ZERO).await;
    let (status, body) = call(
        &app,
        "POST",
        "/v1/charts/generate",
        Some(json!({
            "chart_type": "line",
            "data": [{"Date": "2024-01-01", "revenue": 10}],
            "config": {"x": "Date", "y": ["sales"]}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ConfigMismatch");

    let (status, body) = call(
        &app,
        "POST",
        "/v1/charts/generate",
        Some(json!({"chart_type": "sankey", "data": []})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "UnsupportedChartType");
}

#[tokio::test]
async fn chart_with_insight() {
    let (app, _) = app_with(Duration::ZERO).await;
    let (status, body) = call(
        &app,
        "POST",
        "/v1/charts/generate",
        Some(json!({
            "chart_type": "line",
            "data": [{"Date": "2024-01-01", "revenue": 10}, {"Date": "2024-01-02", "revenue": 12}],
            "config": {"y": "revenue"},
            "include_insight": true
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["spec"]["data"][0]["type"], "scatter");
    assert!(body["insight"].as_str().unwrap().contains("revenue"));
}

#[tokio::test]
async fn unknown_request_ids_are_404() {
    let (app, _) = app_with(Duration::ZERO).await;
    let missing = "6f1c3c1e-2f4b-4f43-9a55-1d8e2f0b7a10";
    for uri in [
        format!("/v1/chat/status/{missing}"),
        format!("/v1/chat/result/{missing}"),
        "/v1/chat/status/not-a-uuid".to_string(),
    ] {
        let (status, body) = call(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(body["error"], "NotFound");
    }
}

#[tokio::test]
async fn submit_poll_and_fetch_result() {
    let (app, _) = app_with(Duration::from_millis(200)).await;
    let (status, body) = call(
        &app,
        "POST",
        "/v1/chat/submit",
        Some(json!({"prompt": "Show me the sales trend for the last 30 days", "chat_id": "c-1", "history": []})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = body["request_id"].as_str().unwrap().to_string();

    let (status, body) = call(&app, "GET", &format!("/v1/chat/result/{id}"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["error"], "NotReady");

    loop {
        let (status, body) = call(&app, "GET", &format!("/v1/chat/status/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        if body["state"] == "SUCCEEDED" {
            break;
        }
        assert_ne!(body["state"], "FAILED");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let (status, body) = call(&app, "GET", &format!("/v1/chat/result/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["blocks"][0]["type"], "text");
    assert_eq!(body["blocks"][1]["type"], "plotly");
    assert_eq!(body["trace"][0]["type"], "llm_call");
}

#[tokio::test]
async fn policy_question_returns_reference_sources() {
    let (app, _) = app_with(Duration::ZERO).await;
    let (_, body) = call(
        &app,
        "POST",
        "/v1/chat/submit",
        Some(json!({"prompt": "What is the remote work policy?"})),
    )
    .await;
    let id = body["request_id"].as_str().unwrap().to_string();

    let body = loop {
        let (status, body) = call(&app, "GET", &format!("/v1/chat/result/{id}"), None).await;
        if status == StatusCode::OK {
            break body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(body["blocks"][1]["type"], "reference");
    let first = &body["blocks"][1]["sources"][0];
    assert_eq!(first["title"], "Remote Work Policy");
    assert_eq!(first["url"], "https://wiki.example.com/remote-policy");
    assert_eq!(body["trace"][1]["type"], "tool_call");
    assert_eq!(body["trace"][1]["label"], "vector_search()");
}

#[tokio::test]
async fn feedback_is_recorded_with_the_session_user() {
    let tables = Arc::new(demo_source(Duration::ZERO).await);
    let sink = Arc::new(MemorySink::new());
    let service = ChatService::spawn(
        Components {
            source: tables.clone(),
            llm: Arc::new(KeywordLlmEngine::new()),
            retriever: Arc::new(demo_corpus()),
            sink: sink.clone(),
        },
        &XchatConfig::default(),
    );
    let app = build_router(AppState { service, tables: None });

    let (status, _) = call(&app, "POST", "/v1/feedback", Some(json!({"rating": 5, "message": "great"}))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = call(&app, "POST", "/v1/feedback", Some(json!({"rating": 0}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "InvalidFeedback");

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1["user_id"], "u-42");

    let (status, _) = call(
        &app,
        "PUT",
        "/v1/data/sources/sales_table",
        Some(json!({"records": []})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
}
