//! HTTP surface of one node.
//!
//! `/v0/entity` serves external clients through the replication
//! coordinator; requests carrying the internal-hop marker bypass it and
//! touch only the local engine, so a replica never re-replicates. Every
//! unknown path or method answers 400.

mod config;

use actix_web::dev::Server;
use actix_web::{delete, get, put, web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use bytes::Bytes;
use serde::Deserialize;
use std::net::TcpListener;
use std::sync::Arc;
use tracing::error;

use crate::cluster::coordinator::{Coordinator, Quorum, ReadOutcome, WriteOutcome};
use crate::cluster::{INTERNAL_HEADER, TIMESTAMP_HEADER, TOMBSTONE_HEADER};
use crate::core::engine::LsmEngine;
use crate::core::record::Record;

pub use config::ServerConfig;

pub struct AppState {
    pub engine: Arc<LsmEngine>,
    pub coordinator: Arc<Coordinator>,
}

#[derive(Deserialize)]
struct EntityParams {
    id: Option<String>,
    replicas: Option<String>,
}

impl EntityParams {
    /// The `id` parameter; `None` when missing or empty (both are 400s).
    fn key(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

fn is_internal(req: &HttpRequest) -> bool {
    req.headers().contains_key(INTERNAL_HEADER)
}

fn header_timestamp(req: &HttpRequest) -> Option<u64> {
    req.headers()
        .get(TIMESTAMP_HEADER)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn parse_quorum(raw: Option<&str>, cluster_size: usize) -> Result<Quorum, HttpResponse> {
    Quorum::parse(raw, cluster_size)
        .map_err(|e| HttpResponse::BadRequest().body(e.to_string()))
}

fn storage_failure(context: &str, e: crate::infra::error::LsmError) -> HttpResponse {
    error!("{context}: {e}");
    HttpResponse::InternalServerError().finish()
}

#[get("/v0/status")]
async fn status() -> impl Responder {
    HttpResponse::Ok().body("OK")
}

#[get("/v0/stats")]
async fn stats(data: web::Data<AppState>) -> HttpResponse {
    match data.engine.stats() {
        Ok(stats) => HttpResponse::Ok().json(stats),
        Err(e) => storage_failure("stats failed", e),
    }
}

#[get("/v0/entity")]
async fn entity_get(
    req: HttpRequest,
    query: web::Query<EntityParams>,
    data: web::Data<AppState>,
) -> HttpResponse {
    let Some(key) = query.key() else {
        return HttpResponse::BadRequest().body("missing or empty id");
    };

    if is_internal(&req) {
        return match data.engine.get_record(key.as_bytes()) {
            Ok(Some(record)) => {
                let timestamp = record.timestamp.to_string();
                match record.value {
                    Some(body) => HttpResponse::Ok()
                        .insert_header((TIMESTAMP_HEADER, timestamp))
                        .body(body),
                    None => HttpResponse::NotFound()
                        .insert_header((TIMESTAMP_HEADER, timestamp))
                        .insert_header((TOMBSTONE_HEADER, "true"))
                        .finish(),
                }
            }
            Ok(None) => HttpResponse::NotFound().finish(),
            Err(e) => storage_failure("replica read failed", e),
        };
    }

    let quorum = match parse_quorum(query.replicas.as_deref(), data.coordinator.cluster_size()) {
        Ok(q) => q,
        Err(resp) => return resp,
    };

    match data.coordinator.get(key, quorum).await {
        ReadOutcome::Found { timestamp, body } => HttpResponse::Ok()
            .insert_header((TIMESTAMP_HEADER, timestamp.to_string()))
            .body(body),
        ReadOutcome::NotFound => HttpResponse::NotFound().finish(),
        ReadOutcome::QuorumUnmet => HttpResponse::GatewayTimeout().body("Not Enough Replicas"),
    }
}

#[put("/v0/entity")]
async fn entity_put(
    req: HttpRequest,
    query: web::Query<EntityParams>,
    body: web::Bytes,
    data: web::Data<AppState>,
) -> HttpResponse {
    let Some(key) = query.key() else {
        return HttpResponse::BadRequest().body("missing or empty id");
    };

    if is_internal(&req) {
        let Some(timestamp) = header_timestamp(&req) else {
            return HttpResponse::BadRequest().body("missing or invalid timestamp");
        };
        let record = Record::present(
            Bytes::copy_from_slice(key.as_bytes()),
            body,
            timestamp,
        );
        return match data.engine.upsert(record) {
            Ok(()) => HttpResponse::Created().finish(),
            Err(e) => storage_failure("replica write failed", e),
        };
    }

    let quorum = match parse_quorum(query.replicas.as_deref(), data.coordinator.cluster_size()) {
        Ok(q) => q,
        Err(resp) => return resp,
    };

    match data.coordinator.put(key, body, quorum).await {
        WriteOutcome::Acked => HttpResponse::Created().finish(),
        WriteOutcome::QuorumUnmet => HttpResponse::GatewayTimeout().body("Not Enough Replicas"),
    }
}

#[delete("/v0/entity")]
async fn entity_delete(
    req: HttpRequest,
    query: web::Query<EntityParams>,
    data: web::Data<AppState>,
) -> HttpResponse {
    let Some(key) = query.key() else {
        return HttpResponse::BadRequest().body("missing or empty id");
    };

    if is_internal(&req) {
        let Some(timestamp) = header_timestamp(&req) else {
            return HttpResponse::BadRequest().body("missing or invalid timestamp");
        };
        let record = Record::tombstone(Bytes::copy_from_slice(key.as_bytes()), timestamp);
        return match data.engine.upsert(record) {
            Ok(()) => HttpResponse::Accepted().finish(),
            Err(e) => storage_failure("replica delete failed", e),
        };
    }

    let quorum = match parse_quorum(query.replicas.as_deref(), data.coordinator.cluster_size()) {
        Ok(q) => q,
        Err(resp) => return resp,
    };

    match data.coordinator.delete(key, quorum).await {
        WriteOutcome::Acked => HttpResponse::Accepted().finish(),
        WriteOutcome::QuorumUnmet => HttpResponse::GatewayTimeout().body("Not Enough Replicas"),
    }
}

async fn unknown_route() -> HttpResponse {
    HttpResponse::BadRequest().finish()
}

/// Builds the node's HTTP server on an already-bound listener. The test
/// harness binds ephemeral ports itself; the launcher binds from config.
pub fn build_server(
    engine: Arc<LsmEngine>,
    coordinator: Arc<Coordinator>,
    max_payload_size: usize,
    listener: TcpListener,
) -> std::io::Result<Server> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(AppState {
                engine: Arc::clone(&engine),
                coordinator: Arc::clone(&coordinator),
            }))
            .app_data(web::PayloadConfig::default().limit(max_payload_size))
            .service(status)
            .service(stats)
            .service(entity_get)
            .service(entity_put)
            .service(entity_delete)
            .default_service(web::route().to(unknown_route))
    })
    .listen(listener)?
    .run();
    Ok(server)
}

/// Binds and runs the server until shutdown.
pub async fn start_server(
    engine: Arc<LsmEngine>,
    coordinator: Arc<Coordinator>,
    config: &ServerConfig,
) -> std::io::Result<()> {
    let listener = TcpListener::bind((config.host.as_str(), config.port))?;
    build_server(engine, coordinator, config.max_payload_size, listener)?.await
}
