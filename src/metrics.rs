// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT
//
//! Prometheus metrics exporter.
use crate::CancellationToken;
use anyhow::{Context, Result};
use axum::{
    Router,
    extract::State,
    http::{
        HeaderValue, StatusCode,
        header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::{net::SocketAddr, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Configuration for the Prometheus metrics server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
    pub allow_origin: Option<String>,
}

#[derive(Clone, Default)]
pub struct MetricsHandle {
    inner: Option<Arc<MetricsInner>>,
}

#[derive(Clone)]
struct MetricsInner {
    registry: Registry,
    synced_block: IntGaugeVec,
    chain_head_block: IntGaugeVec,
    node_synced: IntGaugeVec,
    rows_written: IntCounterVec,
    scan_failures: IntCounterVec,
    allow_origin: Option<String>,
}

impl MetricsHandle {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(Self { inner: None });
        }

        let registry = Registry::new_custom(Some("ibet_indexer".to_string()), None)?;

        let synced_block = IntGaugeVec::new(
            Opts::new(
                "synced_block",
                "Last block whose logs have been committed by a sync job.",
            ),
            &["job"],
        )?;
        registry.register(Box::new(synced_block.clone()))?;

        let chain_head_block = IntGaugeVec::new(
            Opts::new(
                "chain_head_block",
                "Latest block reported by the RPC node to a sync job.",
            ),
            &["job"],
        )?;
        registry.register(Box::new(chain_head_block.clone()))?;

        let node_synced = IntGaugeVec::new(
            Opts::new(
                "node_synced",
                "Whether an RPC node is considered synchronized (1) or not (0).",
            ),
            &["endpoint"],
        )?;
        registry.register(Box::new(node_synced.clone()))?;

        let rows_written = IntCounterVec::new(
            Opts::new("rows_written", "Rows inserted or updated by a sync job."),
            &["job"],
        )?;
        registry.register(Box::new(rows_written.clone()))?;

        let scan_failures = IntCounterVec::new(
            Opts::new(
                "scan_failures",
                "Sync cycles of a job that ended with an error.",
            ),
            &["job"],
        )?;
        registry.register(Box::new(scan_failures.clone()))?;

        // Standard build info style metric: value is always 1.
        let build_info = IntGaugeVec::new(
            Opts::new("build_info", "Build information about the running binary."),
            &["version"],
        )?;
        build_info
            .with_label_values(&[env!("CARGO_PKG_VERSION")])
            .set(1);
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            inner: Some(Arc::new(MetricsInner {
                registry,
                synced_block,
                chain_head_block,
                node_synced,
                rows_written,
                scan_failures,
                allow_origin: config.allow_origin.clone(),
            })),
        })
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    #[inline]
    pub fn record_synced_block(&self, job: &str, block: u64) {
        if let Some(inner) = &self.inner {
            inner
                .synced_block
                .with_label_values(&[job])
                .set(block as i64);
        }
    }

    #[inline]
    pub fn record_chain_head_block(&self, job: &str, block: u64) {
        if let Some(inner) = &self.inner {
            inner
                .chain_head_block
                .with_label_values(&[job])
                .set(block as i64);
        }
    }

    #[inline]
    pub fn record_node_synced(&self, endpoint: &str, is_synced: bool) {
        if let Some(inner) = &self.inner {
            inner
                .node_synced
                .with_label_values(&[endpoint])
                .set(i64::from(is_synced));
        }
    }

    #[inline]
    pub fn record_rows_written(&self, job: &str, rows: usize) {
        if let Some(inner) = &self.inner {
            inner
                .rows_written
                .with_label_values(&[job])
                .inc_by(rows as u64);
        }
    }

    #[inline]
    pub fn record_scan_failure(&self, job: &str) {
        if let Some(inner) = &self.inner {
            inner.scan_failures.with_label_values(&[job]).inc();
        }
    }

    /// Renders the registry in the Prometheus text format.
    pub fn render(&self) -> Result<Option<String>> {
        let Some(inner) = &self.inner else {
            return Ok(None);
        };
        Ok(Some(encode(&inner.registry)?))
    }

    pub async fn serve(
        &self,
        config: MetricsConfig,
        cancellation_token: CancellationToken,
    ) -> Result<Option<JoinHandle<()>>> {
        let Some(inner) = self.inner.clone() else {
            return Ok(None);
        };

        let addr: SocketAddr = format!("{}:{}", config.address, config.port).parse()?;
        let state = MetricsState {
            registry: inner.registry.clone(),
            allow_origin: inner.allow_origin.clone(),
        };

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind metrics server to {addr}"))?;
        info!("Metrics server listening on {}", listener.local_addr()?);

        let mut shutdown = cancellation_token.subscribe();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.recv().await;
                })
                .await
            {
                error!("Metrics server error: {e}");
            }
        });

        Ok(Some(handle))
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[derive(Clone)]
struct MetricsState {
    registry: Registry,
    allow_origin: Option<String>,
}

async fn metrics_handler(State(state): State<MetricsState>) -> Response {
    let body = match encode(&state.registry) {
        Ok(body) => body,
        Err(e) => {
            error!("Failed to encode metrics: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response();
        }
    };

    let mut response = (
        StatusCode::OK,
        [(CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
        body,
    )
        .into_response();

    if let Some(origin) = state.allow_origin.as_ref() {
        let header_value =
            HeaderValue::from_str(origin).unwrap_or_else(|_| HeaderValue::from_static("*"));
        response
            .headers_mut()
            .insert(ACCESS_CONTROL_ALLOW_ORIGIN, header_value);
    }

    response
}
