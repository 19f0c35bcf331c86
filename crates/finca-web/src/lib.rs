//! HTTP surface for the price widget: on-demand price, history and health.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderValue, Method, Request, StatusCode},
    middleware::{from_fn, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use finca_core::{PriceReading, PriceUnit, ReadingSource};
use finca_sync::{build_service_from_config, PriceSyncService, SyncConfig};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "finca-web";

pub const DEFAULT_HISTORY_LIMIT: usize = 30;
pub const MAX_HISTORY_LIMIT: usize = 365;

#[derive(Clone)]
pub struct AppState {
    pub service: PriceSyncService,
}

impl AppState {
    pub fn new(service: PriceSyncService) -> Self {
        Self { service }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub unit: PriceUnit,
    pub currency: String,
    pub source: ReadingSource,
    pub captured_at: DateTime<Utc>,
}

impl From<PriceReading> for HistoryItem {
    fn from(reading: PriceReading) -> Self {
        Self {
            price: reading.price,
            unit: reading.unit,
            currency: reading.currency,
            source: reading.source,
            captured_at: reading.captured_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub ok: bool,
    pub readings: Vec<HistoryItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/price", get(price_handler))
        .route("/price/history", get(history_handler))
        .route("/health", get(health_handler))
        .layer(from_fn(cors_middleware))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &SyncConfig, port: u16) -> anyhow::Result<()> {
    let service = build_service_from_config(config).await?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "price endpoint listening");
    axum::serve(listener, app(AppState::new(service)))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler failed");
            }
        })
        .await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("FINCA_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    serve(&SyncConfig::from_env(), port).await
}

/// `force` is a presence flag: `?force`, `?force=1` and `?force=false` all bypass the cache.
async fn price_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let force = params.contains_key("force");
    // The persist task runs detached; the response does not wait for it.
    let outcome = state.service.handle_request(force).await;
    (StatusCode::OK, Json(outcome.response)).into_response()
}

async fn history_handler(State(state): State<Arc<AppState>>, Query(query): Query<HistoryQuery>) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    match state.service.store().recent(limit).await {
        Ok(readings) => Json(HistoryResponse {
            ok: true,
            readings: readings.into_iter().map(HistoryItem::from).collect(),
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        store: state.service.store().documents().backend().to_string(),
    })
}

/// Any origin, GET only; preflights are answered here with 204.
async fn cors_middleware(req: Request<Body>, next: Next) -> Response {
    let mut resp = if req.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(req).await
    };
    let headers = resp.headers_mut();
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert("access-control-allow-methods", HeaderValue::from_static("GET,OPTIONS"));
    headers.insert("access-control-allow-headers", HeaderValue::from_static("content-type"));
    headers.insert("access-control-max-age", HeaderValue::from_static("3600"));
    resp
}

fn server_error(err: impl std::fmt::Display) -> Response {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "ok": false, "error": err.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{FixedOffset, TimeZone};
    use finca_adapters::{extract_price, ExtractError, ExtractedPrice, MatchCriteria, PriceSource};
    use finca_core::PriceNormalizer;
    use finca_storage::{FetchError, InMemoryDocumentStore};
    use finca_sync::{AlertDispatcher, AlertThresholds, FixedClock, LogNotifier};
    use http_body_util::BodyExt;
    use rust_decimal_macros::dec;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    struct FixtureSource {
        html: Option<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PriceSource for FixtureSource {
        fn source_id(&self) -> &str {
            "fixture"
        }

        async fn fetch(&self) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.html.clone().ok_or_else(|| FetchError::HttpStatus {
                status: 502,
                url: "https://prices.example/".into(),
            })
        }

        fn extract(&self, raw_html: &str) -> Result<Option<ExtractedPrice>, ExtractError> {
            extract_price(raw_html, &MatchCriteria::from_csv("limon,persa"))
        }
    }

    fn fixture_html() -> String {
        std::fs::read_to_string(
            Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/maga-prices/sample.html"),
        )
        .unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 16, 0, 0).single().unwrap()
    }

    fn service(html: Option<String>) -> (PriceSyncService, Arc<FixtureSource>) {
        let source = Arc::new(FixtureSource {
            html,
            calls: AtomicUsize::new(0),
        });
        let service = PriceSyncService::new(
            source.clone(),
            PriceNormalizer::new(PriceUnit::PerThousand, "GTQ"),
            Arc::new(InMemoryDocumentStore::new()),
            AlertDispatcher::new(AlertThresholds::default(), "price-alerts", "Limón Persa", Arc::new(LogNotifier)),
            Arc::new(FixedClock::new(now())),
            FixedOffset::west_opt(6 * 3600).unwrap(),
        );
        (service, source)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn reading(price: Decimal, captured_at: DateTime<Utc>) -> PriceReading {
        PriceReading {
            price,
            unit: PriceUnit::PerThousand,
            currency: "GTQ".into(),
            source: ReadingSource::ScheduledJob,
            captured_at,
        }
    }

    #[tokio::test]
    async fn price_endpoint_scrapes_when_no_reading_today() {
        let (service, source) = service(Some(fixture_html()));
        let (status, json) = get_json(app(AppState::new(service)), "/price").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ok"], serde_json::json!(true));
        assert_eq!(json["price"], serde_json::json!(520.0));
        assert_eq!(json["unit"], serde_json::json!("per-thousand"));
        assert_eq!(json["cached"], serde_json::json!(false));
        assert!(json.get("updatedAt").is_some());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn price_endpoint_serves_cache_unless_force_present() {
        let (service, source) = service(Some(fixture_html()));
        service
            .store()
            .append(&reading(dec!(480), now() - chrono::Duration::hours(1)))
            .await
            .unwrap();
        let app = app(AppState::new(service));

        let (_, cached) = get_json(app.clone(), "/price").await;
        assert_eq!(cached["cached"], serde_json::json!(true));
        assert_eq!(cached["price"], serde_json::json!(480.0));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);

        let (_, forced) = get_json(app, "/price?force=false").await;
        assert_eq!(forced["cached"], serde_json::json!(false));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn price_failure_is_still_200() {
        let (service, _) = service(None);
        let (status, json) = get_json(app(AppState::new(service)), "/price?force").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ok"], serde_json::json!(false));
        assert!(json["error"].as_str().unwrap().contains("502"));
        assert!(json["lastKnown"].is_null());
    }

    #[tokio::test]
    async fn history_is_newest_first_and_clamped() {
        let (service, _) = service(None);
        for (hours, price) in [(48, dec!(440)), (24, dec!(450)), (1, dec!(470))] {
            service
                .store()
                .append(&reading(price, now() - chrono::Duration::hours(hours)))
                .await
                .unwrap();
        }
        let app = app(AppState::new(service));

        let (_, json) = get_json(app.clone(), "/price/history?limit=2").await;
        let prices: Vec<f64> = json["readings"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["price"].as_f64().unwrap())
            .collect();
        assert_eq!(prices, vec![470.0, 450.0]);

        let (_, zero) = get_json(app, "/price/history?limit=0").await;
        assert_eq!(zero["readings"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn preflight_and_cors_headers() {
        let (service, _) = service(Some(fixture_html()));
        let app = app(AppState::new(service));

        let preflight = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/price")
                    .header("origin", "https://finca.example")
                    .header("access-control-request-method", "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(preflight.status(), StatusCode::NO_CONTENT);
        assert_eq!(preflight.headers()["access-control-allow-origin"], "*");
        assert_eq!(preflight.headers()["access-control-allow-methods"], "GET,OPTIONS");

        let health = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        assert_eq!(health.headers()["access-control-allow-origin"], "*");
    }

    #[tokio::test]
    async fn non_get_methods_are_rejected() {
        let (service, _) = service(Some(fixture_html()));
        let resp = app(AppState::new(service))
            .oneshot(Request::builder().method(Method::POST).uri("/price").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn health_reports_store_backend() {
        let (service, _) = service(None);
        let (status, json) = get_json(app(AppState::new(service)), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], serde_json::json!("ok"));
        assert_eq!(json["store"], serde_json::json!("memory"));
    }
}
