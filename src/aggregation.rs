//! The Aggregation Worker (C4, spec §4.4): reserve → derive observations →
//! fold into the Emitter Store → mark done, one batch per transaction.

use chrono::{DateTime, Duration, Utc};
use mac_address::MacAddress;
use serde::Deserialize;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::model::{clamp_mcc_mnc, CellKey, CellRadio, EmitterKey};
use crate::report_log::ReportLog;
use crate::store::{Delta, EmitterStore};

/// Canonical report body (spec §6 "Request body — report", one item). The
/// legacy `/v2/geosubmit` shape (spec §6 "Legacy ingestion") renames a
/// handful of fields; [`ReportItem::from_legacy_json`] maps it onto this
/// shape before the rest of the pipeline ever sees it.
#[derive(Debug, Deserialize)]
pub struct ReportItem {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Opaque pass-through (spec §1 non-goals: "no privacy anonymization
    /// of device IDs beyond opaque pass-through"); the core never inspects it.
    #[serde(default)]
    pub device_id: Option<String>,
    pub gnss: Gnss,
    #[serde(default)]
    pub wifi: Vec<WifiObservation>,
    #[serde(default)]
    pub bluetooth: Vec<BluetoothObservation>,
    #[serde(default)]
    pub cell: Option<CellObservations>,
}

#[derive(Debug, Deserialize)]
pub struct Gnss {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct WifiObservation {
    pub mac: String,
    pub rssi: Option<i16>,
}

#[derive(Debug, Deserialize)]
pub struct BluetoothObservation {
    pub mac: String,
    pub rssi: Option<i16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CellObservations {
    #[serde(default)]
    pub gsm: Vec<GsmCell>,
    #[serde(default)]
    pub wcdma: Vec<WcdmaCell>,
    #[serde(default)]
    pub lte: Vec<LteCell>,
    #[serde(default)]
    pub nr: Vec<NrCell>,
}

#[derive(Debug, Deserialize)]
pub struct GsmCell {
    pub mcc: i32,
    pub mnc: i32,
    pub lac: i32,
    pub ci: i64,
    #[serde(default)]
    pub psc: Option<i16>,
    pub rxlev: Option<i16>,
}

#[derive(Debug, Deserialize)]
pub struct WcdmaCell {
    pub mcc: i32,
    pub mnc: i32,
    pub lac: i32,
    pub ci: i64,
    #[serde(default)]
    pub psc: Option<i16>,
    pub rscp: Option<i16>,
}

#[derive(Debug, Deserialize)]
pub struct LteCell {
    pub mcc: i32,
    pub mnc: i32,
    pub tac: i32,
    pub eci: i64,
    #[serde(default)]
    pub pci: Option<i16>,
    pub rsrp: Option<i16>,
}

#[derive(Debug, Deserialize)]
pub struct NrCell {
    pub mcc: i32,
    pub mnc: i32,
    /// 24-bit unsigned per the spec's open question; negative values are
    /// rejected by validation rather than accepted and reinterpreted.
    pub tac: i32,
    pub nci: i64,
    #[serde(default)]
    pub ssbi: Option<i16>,
    /// The source type's field is named `arcfn`, a transposition of ARFCN.
    /// Both spellings are accepted on input (spec §9 open question); this
    /// field is unused by aggregation and kept only for documentation.
    #[serde(default)]
    pub arfcn: Option<i32>,
    #[serde(default)]
    pub arcfn: Option<i32>,
    #[serde(rename = "ss_rsrp")]
    pub ss_rsrp: Option<i16>,
}

/// Default weight applied when an emitter's strength field is absent (spec
/// §4.4 step 5: "Missing strength ⇒ use a configured default weight"),
/// expressed as a representative dBm value so it flows through the same
/// weight function as a real reading.
const DEFAULT_STRENGTH_DBM: i16 = -90;

const VALIDATION_PAST_DAYS: i64 = 30;
const VALIDATION_FUTURE_DAYS: i64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed report body: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("timestamp out of range")]
    TimestampOutOfRange,
    #[error("latitude out of range")]
    LatitudeOutOfRange,
    #[error("longitude out of range")]
    LongitudeOutOfRange,
    #[error("no emitters present")]
    NoEmitters,
    #[error("GNSS accuracy {0}m exceeds threshold {1}m")]
    GnssAccuracyExceeded(f64, f64),
}

/// Parses and validates one raw report body into the deltas it contributes
/// (spec §4.4 steps 1-5). Returns `Ok(deltas)` with all emitters that parsed
/// validly even if some individual emitters were dropped (step 3); returns
/// `Err` only when the whole report fails (step 2, or zero emitters survive).
pub fn derive_deltas(
    raw: &[u8],
    gnss_max_accuracy_m: f64,
) -> Result<Vec<(EmitterKey, Delta)>, ValidationError> {
    let item: ReportItem = serde_json::from_slice(raw)?;

    let now = Utc::now();
    if item.timestamp < now - Duration::days(VALIDATION_PAST_DAYS)
        || item.timestamp > now + Duration::days(VALIDATION_FUTURE_DAYS)
    {
        return Err(ValidationError::TimestampOutOfRange);
    }
    if !(-90.0..=90.0).contains(&item.gnss.latitude) {
        return Err(ValidationError::LatitudeOutOfRange);
    }
    if !(-180.0..=180.0).contains(&item.gnss.longitude) {
        return Err(ValidationError::LongitudeOutOfRange);
    }
    if let Some(accuracy) = item.gnss.accuracy {
        if accuracy > gnss_max_accuracy_m {
            return Err(ValidationError::GnssAccuracyExceeded(accuracy, gnss_max_accuracy_m));
        }
    }

    let lat = item.gnss.latitude;
    let lon = item.gnss.longitude;
    let mut deltas = Vec::new();

    for wifi in &item.wifi {
        if let Some(mac) = normalize_mac(&wifi.mac) {
            deltas.push((
                EmitterKey::Wifi(mac),
                Delta { lat, lon, strength_dbm: wifi.rssi.unwrap_or(DEFAULT_STRENGTH_DBM) },
            ));
        }
    }

    for bt in &item.bluetooth {
        if let Some(mac) = normalize_mac(&bt.mac) {
            deltas.push((
                EmitterKey::Bluetooth(mac),
                Delta { lat, lon, strength_dbm: bt.rssi.unwrap_or(DEFAULT_STRENGTH_DBM) },
            ));
        }
    }

    if let Some(cells) = &item.cell {
        for c in &cells.gsm {
            deltas.push((
                EmitterKey::Cell(CellKey {
                    radio: CellRadio::Gsm,
                    country: clamp_mcc_mnc(c.mcc),
                    network: clamp_mcc_mnc(c.mnc),
                    area: c.lac,
                    cell: c.ci,
                    unit: c.psc.unwrap_or(0),
                }),
                Delta { lat, lon, strength_dbm: c.rxlev.unwrap_or(DEFAULT_STRENGTH_DBM) },
            ));
        }
        for c in &cells.wcdma {
            deltas.push((
                EmitterKey::Cell(CellKey {
                    radio: CellRadio::Wcdma,
                    country: clamp_mcc_mnc(c.mcc),
                    network: clamp_mcc_mnc(c.mnc),
                    area: c.lac,
                    cell: c.ci,
                    unit: c.psc.unwrap_or(0),
                }),
                Delta { lat, lon, strength_dbm: c.rscp.unwrap_or(DEFAULT_STRENGTH_DBM) },
            ));
        }
        for c in &cells.lte {
            deltas.push((
                EmitterKey::Cell(CellKey {
                    radio: CellRadio::Lte,
                    country: clamp_mcc_mnc(c.mcc),
                    network: clamp_mcc_mnc(c.mnc),
                    area: c.tac,
                    cell: c.eci,
                    unit: c.pci.unwrap_or(0),
                }),
                Delta { lat, lon, strength_dbm: c.rsrp.unwrap_or(DEFAULT_STRENGTH_DBM) },
            ));
        }
        for c in &cells.nr {
            if c.tac < 0 {
                // A negative 24-bit TAC is syntactically invalid; this
                // emitter alone is dropped per step 3, not the whole report.
                continue;
            }
            deltas.push((
                EmitterKey::Cell(CellKey {
                    radio: CellRadio::Nr,
                    country: clamp_mcc_mnc(c.mcc),
                    network: clamp_mcc_mnc(c.mnc),
                    area: c.tac,
                    cell: c.nci,
                    unit: c.ssbi.unwrap_or(0),
                }),
                Delta { lat, lon, strength_dbm: c.ss_rsrp.unwrap_or(DEFAULT_STRENGTH_DBM) },
            ));
        }
    }

    if deltas.is_empty() {
        return Err(ValidationError::NoEmitters);
    }

    Ok(deltas)
}

/// Normalizes and validates a MAC string, rejecting it unless it is one of
/// the two accepted spellings (spec §4.4 step 3, §6).
fn normalize_mac(raw: &str) -> Option<MacAddress> {
    crate::model::parse_mac(raw)
}

pub struct AggregationWorker {
    pool: PgPool,
    report_log: ReportLog,
    store: EmitterStore,
    gnss_max_accuracy_m: f64,
}

impl AggregationWorker {
    pub fn new(pool: PgPool, gnss_max_accuracy_m: f64) -> Self {
        AggregationWorker {
            report_log: ReportLog::new(pool.clone()),
            store: EmitterStore::new(pool.clone()),
            pool,
            gnss_max_accuracy_m,
        }
    }

    /// Runs one reserve/derive/fold/mark-done cycle inside a single
    /// transaction (spec §4.4: "reservation, upserts, and `mark_done` share
    /// a single transaction so a crash re-delivers the batch"). Returns the
    /// number of reports processed (0 means the queue was empty).
    pub async fn run_once(&self, batch_size: i64) -> Result<usize, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let reserved = self.report_log.reserve(&mut tx, batch_size).await?;
        if reserved.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let mut all_deltas = Vec::new();
        let mut outcomes = Vec::new();
        for report in &reserved {
            match derive_deltas(&report.raw, self.gnss_max_accuracy_m) {
                Ok(deltas) => {
                    all_deltas.extend(deltas);
                    outcomes.push((report.id, report.submitted_at, None::<String>));
                }
                Err(err) => {
                    outcomes.push((report.id, report.submitted_at, Some(err.to_string())));
                }
            }
        }

        if !all_deltas.is_empty() {
            self.store.upsert_many(&mut tx, all_deltas).await?;
        }

        for (id, submitted_at, error) in &outcomes {
            match error {
                None => self.report_log.mark_done(&mut tx, *id, *submitted_at).await?,
                Some(reason) => {
                    self.report_log.mark_failed(&mut tx, *id, *submitted_at, reason).await?
                }
            }
        }

        tx.commit().await?;
        info!(batch = reserved.len(), "aggregation batch processed");
        Ok(reserved.len())
    }

    /// Runs `run_once` forever, spacing out empty polls so an idle queue
    /// doesn't spin (spec §4.4, §5: the worker is stateless, retry state
    /// lives entirely in the log).
    pub async fn run_forever(&self, batch_size: i64, idle_delay: std::time::Duration) {
        loop {
            match self.run_once(batch_size).await {
                Ok(0) => tokio::time::sleep(idle_delay).await,
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "aggregation batch failed, will retry");
                    tokio::time::sleep(idle_delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_body() -> serde_json::Value {
        serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "gnss": { "latitude": 56.0112, "longitude": 37.4765, "accuracy": 5.0 },
            "wifi": [
                { "mac": "5ca6e669e5ec", "rssi": -81 },
                { "mac": "50:FF:20:EC:90:D7", "rssi": -73 },
            ],
        })
    }

    #[test]
    fn derives_one_delta_per_wifi_emitter() {
        let raw = serde_json::to_vec(&sample_body()).unwrap();
        let deltas = derive_deltas(&raw, 200.0).unwrap();
        assert_eq!(deltas.len(), 2);
    }

    #[test]
    fn mac_formatting_equivalence_normalizes_to_same_key() {
        let a = normalize_mac("50:FF:20:EC:90:D7").unwrap();
        let b = normalize_mac("50ff20ec90d7").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_malformed_mac_but_keeps_valid_siblings() {
        let mut body = sample_body();
        body["wifi"].as_array_mut().unwrap().push(serde_json::json!({ "mac": "not-a-mac", "rssi": -50 }));
        let raw = serde_json::to_vec(&body).unwrap();
        let deltas = derive_deltas(&raw, 200.0).unwrap();
        assert_eq!(deltas.len(), 2);
    }

    #[test]
    fn rejects_out_of_range_latitude() {
        let mut body = sample_body();
        body["gnss"]["latitude"] = serde_json::json!(200.0);
        let raw = serde_json::to_vec(&body).unwrap();
        assert!(matches!(
            derive_deltas(&raw, 200.0),
            Err(ValidationError::LatitudeOutOfRange)
        ));
    }

    #[test]
    fn rejects_gnss_accuracy_above_threshold() {
        let mut body = sample_body();
        body["gnss"]["accuracy"] = serde_json::json!(500.0);
        let raw = serde_json::to_vec(&body).unwrap();
        assert!(matches!(
            derive_deltas(&raw, 200.0),
            Err(ValidationError::GnssAccuracyExceeded(_, _))
        ));
    }

    #[test]
    fn no_emitters_is_rejected() {
        let mut body = sample_body();
        body["wifi"] = serde_json::json!([]);
        let raw = serde_json::to_vec(&body).unwrap();
        assert!(matches!(derive_deltas(&raw, 200.0), Err(ValidationError::NoEmitters)));
    }

    #[test]
    fn clamps_mcc_mnc_into_bounds() {
        assert_eq!(clamp_mcc_mnc(0), 1);
        assert_eq!(clamp_mcc_mnc(5000), 999);
        assert_eq!(clamp_mcc_mnc(250), 250);
    }
}
