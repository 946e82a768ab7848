//! `POST /v2/geosubmit` (spec §6): legacy ingestion format, unauthenticated
//! (the endpoint is only reachable from a restricted network). Items are
//! normalized onto the canonical report shape and appended to the log
//! exactly like `/api/v1/report`; the Aggregation Worker never sees the
//! legacy field names.

use actix_web::http::header::USER_AGENT;
use actix_web::{post, web, HttpRequest, HttpResponse};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::error::AppError;
use crate::report_log::ReportLog;

#[derive(Debug, Deserialize)]
pub struct LegacySubmission {
    pub items: Vec<LegacyReport>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyReport {
    pub timestamp: i64,
    pub position: LegacyPosition,
    #[serde(default)]
    pub wifi_access_points: Vec<LegacyWifi>,
    #[serde(default)]
    pub bluetooth_beacons: Vec<LegacyBluetooth>,
    #[serde(default)]
    pub cell_towers: Vec<LegacyCell>,
}

#[derive(Debug, Deserialize)]
pub struct LegacyPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyWifi {
    pub mac_address: String,
    pub signal_strength: Option<i16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyBluetooth {
    pub mac_address: String,
    pub signal_strength: Option<i16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyCell {
    pub radio_type: String,
    pub mobile_country_code: i32,
    pub mobile_network_code: i32,
    pub location_area_code: i32,
    pub cell_id: i64,
    #[serde(default)]
    pub primary_scrambling_code: Option<i16>,
    pub signal_strength: Option<i16>,
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Rebuilds a legacy item into the canonical shape [`crate::aggregation::ReportItem`]
/// parses, so the rest of the pipeline runs unmodified.
fn to_canonical(item: &LegacyReport) -> serde_json::Value {
    let wifi: Vec<_> = item
        .wifi_access_points
        .iter()
        .map(|w| json!({ "mac": w.mac_address, "rssi": w.signal_strength }))
        .collect();
    let bluetooth: Vec<_> = item
        .bluetooth_beacons
        .iter()
        .map(|b| json!({ "mac": b.mac_address, "rssi": b.signal_strength }))
        .collect();

    let mut gsm = Vec::new();
    let mut wcdma = Vec::new();
    let mut lte = Vec::new();
    let mut nr = Vec::new();
    for c in &item.cell_towers {
        let entry = json!({
            "mcc": c.mobile_country_code,
            "mnc": c.mobile_network_code,
            "lac": c.location_area_code,
            "tac": c.location_area_code,
            "ci": c.cell_id,
            "eci": c.cell_id,
            "nci": c.cell_id,
            "psc": c.primary_scrambling_code,
            "pci": c.primary_scrambling_code,
            "ssbi": c.primary_scrambling_code,
            "rxlev": c.signal_strength,
            "rscp": c.signal_strength,
            "rsrp": c.signal_strength,
            "ss_rsrp": c.signal_strength,
        });
        match c.radio_type.to_lowercase().as_str() {
            "gsm" => gsm.push(entry),
            "wcdma" | "umts" => wcdma.push(entry),
            "lte" => lte.push(entry),
            "nr" => nr.push(entry),
            _ => {}
        }
    }

    json!({
        "timestamp": millis_to_datetime(item.timestamp).to_rfc3339(),
        "gnss": {
            "latitude": item.position.latitude,
            "longitude": item.position.longitude,
            "accuracy": item.position.accuracy,
        },
        "wifi": wifi,
        "bluetooth": bluetooth,
        "cell": { "gsm": gsm, "wcdma": wcdma, "lte": lte, "nr": nr },
    })
}

#[post("/v2/geosubmit")]
pub async fn geosubmit(
    req: HttpRequest,
    log: web::Data<ReportLog>,
    body: web::Json<LegacySubmission>,
) -> Result<HttpResponse, AppError> {
    let user_agent = req.headers().get(USER_AGENT).and_then(|v| v.to_str().ok());

    for item in &body.items {
        let canonical = to_canonical(item);
        let raw = serde_json::to_vec(&canonical).map_err(|e| AppError::Validation(e.to_string()))?;
        log.append(
            &raw,
            millis_to_datetime(item.timestamp),
            item.position.latitude,
            item.position.longitude,
            user_agent,
        )
        .await?;
    }
    Ok(HttpResponse::Ok().finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_legacy_wifi_field_names_onto_canonical_shape() {
        let legacy = LegacyReport {
            timestamp: 1_700_000_000_000,
            position: LegacyPosition { latitude: 56.0, longitude: 37.0, accuracy: None },
            wifi_access_points: vec![LegacyWifi { mac_address: "50ff20ec90d7".into(), signal_strength: Some(-80) }],
            bluetooth_beacons: vec![],
            cell_towers: vec![],
        };
        let canonical = to_canonical(&legacy);
        assert_eq!(canonical["wifi"][0]["mac"], "50ff20ec90d7");
        assert_eq!(canonical["wifi"][0]["rssi"], -80);
    }
}
