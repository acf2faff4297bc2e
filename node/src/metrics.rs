//! # Prometheus Metrics
//!
//! Operational metrics of the node, scraped at `/metrics`, plus a small
//! JSON `/status` endpoint describing the hosted party.
//!
//! All metrics live in a dedicated [`prometheus::Registry`] so they do not
//! collide with any default global registry consumers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use serde::Serialize;
use std::sync::Arc;

use tokenflow_protocol::ttx::PartyContext;

/// Metric handles of the node. Cloning shares the underlying metrics.
///
/// A serving node only exposes hub state; transaction counters are added
/// with [`NodeMetrics::register_transactions`] by the code paths that drive
/// transactions to finality.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Sessions opened on the hub, refreshed on every scrape.
    pub sessions_opened: IntGauge,
}

/// Counters for transactions driven by this process.
#[derive(Clone)]
pub struct TransactionMetrics {
    /// Transactions whose endorsement round completed.
    pub endorsed_total: IntCounter,
    /// Transactions the ledger confirmed.
    pub confirmed_total: IntCounter,
    /// Transactions that failed at any step.
    pub failed_total: IntCounter,
    /// Time from building a transaction to its finality.
    pub latency_seconds: Histogram,
}

impl NodeMetrics {
    /// Creates the registry and the hub gauge.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("tokenflow".into()), None)?;

        let sessions_opened = IntGauge::new("sessions_opened", "Sessions opened on the hub")?;
        registry.register(Box::new(sessions_opened.clone()))?;

        Ok(Self {
            registry,
            sessions_opened,
        })
    }

    /// Registers the transaction counters. Fails if called twice on the
    /// same registry.
    pub fn register_transactions(&self) -> Result<TransactionMetrics, prometheus::Error> {
        let endorsed_total = IntCounter::new(
            "transactions_endorsed_total",
            "Transactions whose endorsement round completed",
        )?;
        self.registry.register(Box::new(endorsed_total.clone()))?;

        let confirmed_total = IntCounter::new(
            "transactions_confirmed_total",
            "Transactions confirmed by the ledger",
        )?;
        self.registry.register(Box::new(confirmed_total.clone()))?;

        let failed_total =
            IntCounter::new("transactions_failed_total", "Transactions that failed")?;
        self.registry.register(Box::new(failed_total.clone()))?;

        let latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "transaction_latency_seconds",
                "Latency from transaction creation to finality in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        self.registry.register(Box::new(latency_seconds.clone()))?;

        Ok(TransactionMetrics {
            endorsed_total,
            confirmed_total,
            failed_total,
            latency_seconds,
        })
    }

    /// Encodes all registered metrics into the Prometheus text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// State shared by the HTTP handlers.
#[derive(Clone)]
pub struct NodeState {
    pub metrics: Arc<NodeMetrics>,
    pub party: Arc<PartyContext>,
    pub started: DateTime<Utc>,
}

/// `/status` body.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub version: String,
    pub protocol: String,
    pub party: String,
    pub auditor: bool,
    pub opened_sessions: u64,
    pub started: DateTime<Utc>,
    pub uptime_secs: i64,
}

pub fn router(state: NodeState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

/// Renders `/metrics` in Prometheus text format.
async fn metrics_handler(State(state): State<NodeState>) -> impl IntoResponse {
    let opened = state.party.hub().opened_sessions();
    state
        .metrics
        .sessions_opened
        .set(i64::try_from(opened).unwrap_or(i64::MAX));
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

async fn status_handler(State(state): State<NodeState>) -> Json<StatusReport> {
    let now = Utc::now();
    Json(StatusReport {
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol: tokenflow_protocol::config::PROTOCOL_VERSION.to_string(),
        party: state.party.me().to_string(),
        auditor: state.party.auditor().is_some(),
        opened_sessions: state.party.hub().opened_sessions(),
        started: state.started,
        uptime_secs: (now - state.started).num_seconds(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tokenflow_protocol::identity::WalletRegistry;
    use tokenflow_protocol::ttx::Infrastructure;
    use tower::ServiceExt;

    fn state() -> NodeState {
        let wallets = Arc::new(WalletRegistry::new());
        wallets.create_wallet("node");
        let party = PartyContext::builder(&Infrastructure::default(), wallets)
            .build()
            .unwrap();
        NodeState {
            metrics: Arc::new(NodeMetrics::new().unwrap()),
            party,
            started: Utc::now(),
        }
    }

    async fn scrape(state: NodeState) -> String {
        let resp = router(state)
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn serving_node_exposes_only_hub_state() {
        let text = scrape(state()).await;
        assert!(text.contains("tokenflow_sessions_opened 0"));
        assert!(!text.contains("transactions_confirmed_total"));
        assert!(!text.contains("transaction_latency_seconds"));
    }

    #[tokio::test]
    async fn registered_transaction_counters_are_listed() {
        let state = state();
        let txs = state.metrics.register_transactions().unwrap();
        txs.confirmed_total.inc();

        let text = scrape(state).await;
        assert!(text.contains("tokenflow_transactions_confirmed_total 1"));
        assert!(text.contains("tokenflow_transactions_failed_total 0"));
        assert!(text.contains("tokenflow_sessions_opened 0"));
    }

    #[test]
    fn transaction_counters_register_once() {
        let metrics = NodeMetrics::new().unwrap();
        metrics.register_transactions().unwrap();
        assert!(metrics.register_transactions().is_err());
    }

    #[tokio::test]
    async fn status_endpoint_describes_party() {
        let state = state();
        let party = state.party.me().to_string();
        let resp = router(state)
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["party"], party);
        assert_eq!(json["auditor"], false);
    }
}
