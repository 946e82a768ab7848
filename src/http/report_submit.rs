//! `POST /api/v1/report` (spec §6): append a ground-truth batch. Returns
//! HTTP 202 once every item is durably appended; processing happens later,
//! asynchronously, in the Aggregation Worker.

use actix_web::http::header::USER_AGENT;
use actix_web::{post, web, HttpRequest, HttpResponse};
use serde::Deserialize;

use crate::error::AppError;
use crate::report_log::ReportLog;

#[derive(Debug, Deserialize)]
pub struct ReportBatch {
    pub items: Vec<serde_json::Value>,
}

#[post("/api/v1/report")]
pub async fn report(
    req: HttpRequest,
    log: web::Data<ReportLog>,
    body: web::Json<ReportBatch>,
) -> Result<HttpResponse, AppError> {
    if body.items.is_empty() {
        return Err(AppError::Validation("items must not be empty".into()));
    }

    let user_agent = req.headers().get(USER_AGENT).and_then(|v| v.to_str().ok());

    for item in &body.items {
        let timestamp = item
            .get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);
        let gnss = item.get("gnss").ok_or_else(|| AppError::Validation("gnss is required".into()))?;
        let lat = gnss
            .get("latitude")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| AppError::Validation("gnss.latitude is required".into()))?;
        let lon = gnss
            .get("longitude")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| AppError::Validation("gnss.longitude is required".into()))?;

        let raw = serde_json::to_vec(item).map_err(|e| AppError::Validation(e.to_string()))?;
        log.append(&raw, timestamp, lat, lon, user_agent).await?;
    }

    Ok(HttpResponse::Accepted().finish())
}
