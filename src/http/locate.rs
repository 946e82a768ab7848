//! `POST /api/v1/locate` (spec §6).

use std::net::IpAddr;

use actix_web::{post, web, HttpRequest, HttpResponse};

use crate::error::AppError;
use crate::inference::{InferenceEngine, LocateQuery};

/// The client IP consulted by the optional IP fallback (SPEC_FULL.md
/// §B.1), read from `X-Forwarded-For` the same way the teacher's `geoip`
/// module does — this service sits behind a reverse proxy, so the TCP
/// peer address is the proxy's, not the caller's.
fn client_ip(req: &HttpRequest) -> Option<IpAddr> {
    req.headers()
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
}

#[post("/api/v1/locate")]
pub async fn locate(
    engine: web::Data<InferenceEngine>,
    req: HttpRequest,
    body: web::Json<LocateQuery>,
) -> Result<HttpResponse, AppError> {
    let response = engine.locate(&body, client_ip(&req)).await?;
    Ok(HttpResponse::Ok().json(response))
}
