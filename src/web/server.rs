use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::Config;
use crate::dns::engine::QueryEngine;

/// Liveness and stats endpoint: a fixed string on `/` for health checks,
/// read-only JSON views of the verdict cache and query journal under /api.
pub struct WebServer {
    engine: Arc<QueryEngine>,
    config: Arc<Config>,
}

#[derive(Clone)]
struct AppState {
    engine: Arc<QueryEngine>,
}

#[derive(Deserialize)]
struct JournalQuery {
    domain: Option<String>,
    limit: Option<usize>,
}

impl WebServer {
    pub fn new(engine: Arc<QueryEngine>, config: Arc<Config>) -> Self {
        Self { engine, config }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        if !self.config.web.enabled {
            info!("Web endpoint disabled");
            return Ok(());
        }

        let app = build_router(AppState {
            engine: self.engine.clone(),
        });

        let addr = format!("{}:{}", self.config.web.address, self.config.web.port);
        info!("🌐 Liveness endpoint on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/api/stats", get(api_stats))
        .route("/api/cache", get(api_cache))
        .route("/api/journal", get(api_journal))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn liveness() -> &'static str {
    "hi"
}

async fn api_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.engine.get_stats())
}

async fn api_cache(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "entries": state.engine.cache.list_entries(),
        "stats": state.engine.cache.get_stats(),
    }))
}

async fn api_journal(
    State(state): State<AppState>,
    Query(params): Query<JournalQuery>,
) -> Json<serde_json::Value> {
    let limit = params.limit.unwrap_or(100);
    let entries = state.engine.journal.search(params.domain.as_deref(), limit);
    Json(serde_json::json!({
        "entries": entries,
        "stats": state.engine.journal.get_stats(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Classification;

    async fn test_engine() -> Arc<QueryEngine> {
        let mut config = Config::default();
        // Loopback sinks - these tests never route a query
        config.upstreams.local_dns = "127.0.0.1:1".to_string();
        config.upstreams.honeypot_dns = "127.0.0.1:1".to_string();
        config.upstreams.tls_dns = "127.0.0.1:1".to_string();
        config.persist.enabled = false;
        Arc::new(QueryEngine::new(Arc::new(config)).await.unwrap())
    }

    #[tokio::test]
    async fn test_liveness_and_stats_endpoints() {
        let engine = test_engine().await;
        engine.cache.put("seen.example", Classification::Polluted, 300);

        let app = build_router(AppState { engine });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let body = reqwest::get(format!("http://{}/", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "hi");

        let stats: serde_json::Value = reqwest::get(format!("http://{}/api/stats", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["cache"]["entries"], 1);

        let cache: serde_json::Value = reqwest::get(format!("http://{}/api/cache", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(cache["entries"][0]["hostname"], "seen.example");
        assert_eq!(cache["entries"][0]["state"], "polluted");
    }
}
