//! Worker registration, heartbeat, and listing

use crate::auth::{effective_client_ip, AuthedWorker};
use crate::config::Config;
use crate::db::worker_repo;
use crate::error::Result;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use sqlx::PgPool;
use worker_protocol::{HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse};

/// Register a new worker and hand back its API key. The key is shown exactly
/// once; afterwards only the hash exists.
pub async fn register(
    pool: web::Data<PgPool>,
    config: web::Data<Config>,
    req: HttpRequest,
    body: web::Json<RegisterRequest>,
) -> Result<HttpResponse> {
    let body = body.into_inner();

    if !matches!(body.worker_type.as_str(), "local" | "remote") {
        return Err(crate::error::ApiError::BadRequest(format!(
            "invalid worker_type: {}",
            body.worker_type
        )));
    }

    let (worker, api_key) = worker_repo::register(
        pool.get_ref(),
        body.worker_name.as_deref(),
        &body.worker_type,
        body.capabilities.as_ref(),
    )
    .await?;

    tracing::info!(
        worker_id = %worker.worker_id,
        worker_type = %worker.worker_type,
        client_ip = %effective_client_ip(&req, &config.app.trusted_proxies),
        "Worker registered"
    );

    Ok(HttpResponse::Ok().json(RegisterResponse {
        worker_id: worker.worker_id,
        api_key,
        message: "Store this API key now; it cannot be retrieved again".to_string(),
    }))
}

/// Heartbeat: liveness stamp plus optional capability refresh.
pub async fn heartbeat(
    pool: web::Data<PgPool>,
    worker: AuthedWorker,
    body: web::Json<HeartbeatRequest>,
) -> Result<HttpResponse> {
    let body = body.into_inner();

    worker_repo::heartbeat(pool.get_ref(), worker.0.id, body.capabilities.as_ref()).await?;

    tracing::debug!(
        worker_id = %worker.0.worker_id,
        status = %body.status,
        "Heartbeat received"
    );

    Ok(HttpResponse::Ok().json(HeartbeatResponse {
        status: "ok".to_string(),
        server_time: Utc::now(),
    }))
}

/// List registered workers (admin/CLI surface).
pub async fn list(pool: web::Data<PgPool>, _worker: AuthedWorker) -> Result<HttpResponse> {
    let workers = worker_repo::list(pool.get_ref()).await?;
    let total = workers.len();
    let active = workers.iter().filter(|w| w.status == "active").count();
    let offline = workers.iter().filter(|w| w.status == "offline").count();

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "workers": workers,
        "total_count": total,
        "active_count": active,
        "offline_count": offline,
    })))
}
