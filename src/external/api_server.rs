use crate::adapter::{build_outbound, OutboundRegistry, OutboundType};
use crate::config::RuleSchema;
use crate::dispatch::Dispatching;
use crate::proxy::{format_speed, ProxyInfo, ProxySource, SourceManager, StatCenter};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

/// Loopback control plane: rules, proxy sources, transports and traffic
/// statistics.
#[derive(Clone)]
pub struct ApiServer {
    rules: Arc<Dispatching>,
    registry: Arc<OutboundRegistry>,
    stats: Arc<StatCenter>,
    sources: Arc<SourceManager>,
    http_port: u16,
    socks5_port: u16,
}

impl ApiServer {
    pub fn new(
        rules: Arc<Dispatching>,
        registry: Arc<OutboundRegistry>,
        stats: Arc<StatCenter>,
        sources: Arc<SourceManager>,
        http_port: u16,
        socks5_port: u16,
    ) -> Self {
        Self {
            rules,
            registry,
            stats,
            sources,
            http_port,
            socks5_port,
        }
    }

    pub async fn run(self, port: u16) {
        let app = Router::new()
            .route("/rules", get(Self::get_rules).put(Self::put_rules))
            .route(
                "/proxy-sources",
                get(Self::get_sources).post(Self::post_source),
            )
            .route("/proxy-sources/:id", delete(Self::delete_source))
            .route("/proxy-sources/:id/proxies", put(Self::put_source_proxies))
            .route(
                "/proxy-sources/:id/current-proxy",
                put(Self::put_current_proxy),
            )
            .route("/stats", get(Self::get_stats))
            .route(
                "/protocols",
                get(Self::get_protocols).post(Self::post_protocol),
            )
            .route("/status", get(Self::get_status))
            .with_state(self);
        let addr = SocketAddr::new(Ipv4Addr::new(127, 0, 0, 1).into(), port);
        tracing::info!("[API] Listen control plane at {}, running...", addr);
        if let Err(err) = axum::Server::bind(&addr)
            .serve(app.into_make_service())
            .await
        {
            tracing::error!("[API] server terminated: {}", err);
        }
    }

    async fn get_rules(State(server): State<Self>) -> Json<Vec<RuleSchema>> {
        Json(server.rules.rules())
    }

    async fn put_rules(
        State(server): State<Self>,
        Json(rules): Json<Vec<RuleSchema>>,
    ) -> StatusCode {
        server.rules.update(rules);
        StatusCode::OK
    }

    async fn get_sources(State(server): State<Self>) -> Json<Vec<ProxySource>> {
        Json(server.sources.list_sources())
    }

    async fn post_source(
        State(server): State<Self>,
        Json(source): Json<ProxySource>,
    ) -> StatusCode {
        server.sources.add_source(source);
        StatusCode::CREATED
    }

    async fn delete_source(State(server): State<Self>, Path(id): Path<String>) -> StatusCode {
        server.sources.remove_source(&id);
        StatusCode::OK
    }

    async fn put_source_proxies(
        State(server): State<Self>,
        Path(id): Path<String>,
        Json(proxies): Json<HashMap<String, ProxyInfo>>,
    ) -> StatusCode {
        if server.sources.update_proxies(&id, proxies) {
            StatusCode::OK
        } else {
            StatusCode::NOT_FOUND
        }
    }

    async fn put_current_proxy(
        State(server): State<Self>,
        Path(id): Path<String>,
        Json(proxy): Json<ProxyInfo>,
    ) -> (StatusCode, String) {
        match server.sources.set_current_proxy(&id, proxy) {
            Ok(()) => (StatusCode::OK, "Current proxy set".to_string()),
            Err(err) => (StatusCode::BAD_REQUEST, err.to_string()),
        }
    }

    async fn get_stats(State(server): State<Self>) -> Json<Value> {
        let current = server.sources.current_proxies();
        let mut stats = serde_json::Map::new();
        let mut upload_rate = 0u64;
        let mut download_rate = 0u64;
        for collector in server.stats.snapshot() {
            let source_id = collector.source_id();
            let (proxy_id, proxy_name) = current
                .get(source_id)
                .map(|p| (p.id.clone(), p.name.clone()))
                .unwrap_or_default();
            stats.insert(
                source_id.to_string(),
                json!({
                    "source_id": source_id,
                    "proxy_id": proxy_id,
                    "proxy_name": proxy_name,
                    "upload": collector.upload(),
                    "download": collector.download(),
                }),
            );
            upload_rate += collector.upload_rate();
            download_rate += collector.download_rate();
        }
        Json(json!({
            "stats": stats,
            "upload_speed": format_speed(upload_rate, true),
            "download_speed": format_speed(download_rate, false),
        }))
    }

    async fn get_protocols(State(server): State<Self>) -> Json<Value> {
        let mut protocols = serde_json::Map::new();
        for (key, outbound) in server.registry.list() {
            protocols.insert(
                key,
                json!({
                    "name": outbound.name(),
                    "type": outbound.outbound_type(),
                    "running": outbound.is_running(),
                }),
            );
        }
        Json(json!({ "protocols": protocols }))
    }

    async fn post_protocol(
        State(server): State<Self>,
        Json(req): Json<CreateProtocolRequest>,
    ) -> (StatusCode, String) {
        match build_outbound(
            req.kind,
            &req.name,
            req.server.as_deref().unwrap_or_default(),
            req.port.unwrap_or_default(),
            &req.config,
        ) {
            Ok(outbound) => {
                server.registry.register(&req.name, outbound);
                (StatusCode::CREATED, "Protocol added".to_string())
            }
            Err(err) => (StatusCode::BAD_REQUEST, err.to_string()),
        }
    }

    async fn get_status(State(server): State<Self>) -> Json<Value> {
        Json(json!({
            "running": true,
            "http_port": server.http_port,
            "socks5_port": server.socks5_port,
        }))
    }
}

#[derive(Deserialize)]
struct CreateProtocolRequest {
    name: String,
    #[serde(rename = "type")]
    kind: OutboundType,
    server: Option<String>,
    port: Option<u16>,
    #[serde(flatten)]
    config: HashMap<String, Value>,
}
