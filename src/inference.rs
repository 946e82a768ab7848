//! The Inference Engine (C5, spec §4.5): answers locate queries by fusing
//! the emitters the query describes, falling back to the coarse cell
//! dataset and, beyond the spec's core algorithm, an optional IP-range
//! fallback (SPEC_FULL.md §B.1).

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::error;

use crate::bounds::{check_invariants, weight};
use crate::geoip::{GeoIpLookup, GEOIP_ACCURACY_M};
use crate::model::{clamp_mcc_mnc, parse_mac, CellKey, CellRadio, EmitterKey};
use crate::store::EmitterStore;

const DEFAULT_GNSS_ACCURACY_M: f64 = 10.0;
const MIN_ACCURACY_M: f64 = 10.0;
const DISTANCE_EPSILON_M: f64 = 1.0;
const EARTH_RADIUS_M: f64 = 6_371_008.8;

#[derive(Debug, Deserialize, Default)]
pub struct LocateQuery {
    pub gnss: Option<QueryGnss>,
    #[serde(default)]
    pub wifi: Vec<QueryWifi>,
    #[serde(default)]
    pub bluetooth: Vec<QueryBluetooth>,
    #[serde(default)]
    pub cell: Option<QueryCells>,
}

#[derive(Debug, Deserialize)]
pub struct QueryGnss {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub accuracy: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct QueryWifi {
    pub mac: String,
    pub rssi: Option<i16>,
}

#[derive(Debug, Deserialize)]
pub struct QueryBluetooth {
    pub mac: String,
    pub rssi: Option<i16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct QueryCells {
    #[serde(default)]
    pub gsm: Vec<QueryCell>,
    #[serde(default)]
    pub wcdma: Vec<QueryCell>,
    #[serde(default)]
    pub lte: Vec<QueryCell>,
    #[serde(default)]
    pub nr: Vec<QueryCell>,
}

#[derive(Debug, Deserialize)]
pub struct QueryCell {
    pub mcc: i32,
    pub mnc: i32,
    pub area: i32,
    pub cell: i64,
    #[serde(default)]
    pub unit: Option<i16>,
    pub strength: Option<i16>,
}

#[derive(Debug, Serialize, Clone, Copy)]
pub struct Location {
    pub longitude: f64,
    pub latitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct LocateResponse {
    pub location: Location,
    pub accuracy: f64,
}

pub struct InferenceEngine {
    store: EmitterStore,
    geoip_pool: PgPool,
    geoip: GeoIpLookup,
    ip_fallback: bool,
}

/// One resolved emitter observation carried through fusion: the query's
/// reported strength and the store's learned aggregate.
struct Resolved {
    lat: f64,
    lon: f64,
    accuracy: f64,
    strength_dbm: i16,
}

impl InferenceEngine {
    pub fn new(pool: PgPool, ip_fallback: bool) -> Self {
        InferenceEngine {
            store: EmitterStore::new(pool.clone()),
            geoip: GeoIpLookup::new(pool.clone()),
            geoip_pool: pool,
            ip_fallback,
        }
    }

    /// Answers a locate query (spec §4.5). `client_ip` is only consulted
    /// when every other path (GNSS, learned emitters, coarse cell prior)
    /// comes up empty and `Config::ip_fallback` is enabled
    /// (SPEC_FULL.md §B.1) — it is tried immediately before giving up, not
    /// instead of any documented step.
    pub async fn locate(
        &self,
        query: &LocateQuery,
        client_ip: Option<IpAddr>,
    ) -> Result<LocateResponse, crate::error::AppError> {
        // Step 1: a direct GNSS fix always wins (spec §8 property 6).
        if let Some(gnss) = &query.gnss {
            if gnss.latitude.is_finite() && gnss.longitude.is_finite() {
                return Ok(LocateResponse {
                    location: Location {
                        longitude: gnss.longitude,
                        latitude: gnss.latitude,
                        altitude: gnss.altitude,
                    },
                    accuracy: gnss.accuracy.unwrap_or(DEFAULT_GNSS_ACCURACY_M),
                });
            }
        }

        // Step 2: collect emitter keys, with their query-reported strength.
        let mut keyed: Vec<(EmitterKey, i16)> = Vec::new();
        for w in &query.wifi {
            if let Some(mac) = parse_mac(&w.mac) {
                keyed.push((EmitterKey::Wifi(mac), w.rssi.unwrap_or(-90)));
            }
        }
        for b in &query.bluetooth {
            if let Some(mac) = parse_mac(&b.mac) {
                keyed.push((EmitterKey::Bluetooth(mac), b.rssi.unwrap_or(-90)));
            }
        }
        let mut cell_keys: Vec<(CellKey, i16)> = Vec::new();
        if let Some(cells) = &query.cell {
            for (radio, list) in [
                (CellRadio::Gsm, &cells.gsm),
                (CellRadio::Wcdma, &cells.wcdma),
                (CellRadio::Lte, &cells.lte),
                (CellRadio::Nr, &cells.nr),
            ] {
                for c in list {
                    let key = CellKey {
                        radio,
                        country: clamp_mcc_mnc(c.mcc),
                        network: clamp_mcc_mnc(c.mnc),
                        area: c.area,
                        cell: c.cell,
                        unit: c.unit.unwrap_or(0),
                    };
                    cell_keys.push((key, c.strength.unwrap_or(-90)));
                    keyed.push((EmitterKey::Cell(key), c.strength.unwrap_or(-90)));
                }
            }
        }

        // Step 3: batched lookup; keys absent from the store are discarded.
        let all_keys: Vec<EmitterKey> = keyed.iter().map(|(k, _)| *k).collect();
        let found = self.store.get_many(&all_keys).await?;

        let mut resolved: Vec<Resolved> = Vec::new();
        for (key, strength_dbm) in &keyed {
            if let Some(agg) = found.get(key) {
                if let Err(violation) = check_invariants(agg) {
                    error!(?key, %violation, "emitter aggregate violates an internal invariant, failing closed");
                    return Err(crate::error::AppError::Internal(violation));
                }
                resolved.push(Resolved { lat: agg.lat, lon: agg.lon, accuracy: agg.accuracy, strength_dbm: *strength_dbm });
            }
        }

        if resolved.is_empty() {
            if let Some(fallback) = self.coarse_cell_fallback(&cell_keys).await? {
                return Ok(fallback);
            }
            if self.ip_fallback {
                if let Some(ip) = client_ip {
                    if let Some(estimate) = self.geoip.lookup(ip).await.map_err(crate::error::AppError::from)? {
                        return Ok(LocateResponse {
                            location: Location {
                                longitude: estimate.longitude,
                                latitude: estimate.latitude,
                                altitude: None,
                            },
                            accuracy: GEOIP_ACCURACY_M,
                        });
                    }
                }
            }
            return Err(crate::error::AppError::NoCoverage);
        }

        // Step 4: weighted centroid with wᵢ = w(strengthᵢ) · 1/max(accuracyᵢ, ε).
        let centroid = weighted_centroid(&resolved);

        // Step 5: outlier trimming.
        let trimmed = trim_outliers(&resolved, centroid);
        let final_centroid = if trimmed.len() == resolved.len() {
            centroid
        } else {
            weighted_centroid(&trimmed)
        };

        // Step 6: accuracy = weighted RMS distance, floored and capped.
        let accuracy = rms_accuracy(&trimmed, final_centroid);

        Ok(LocateResponse {
            location: Location { longitude: final_centroid.1, latitude: final_centroid.0, altitude: None },
            accuracy,
        })
    }

    /// Coarse cell-level prior fallback (spec §4.5 step 3): smallest radius
    /// wins when several query cells match the imported dataset.
    async fn coarse_cell_fallback(
        &self,
        cell_keys: &[(CellKey, i16)],
    ) -> Result<Option<LocateResponse>, crate::error::AppError> {
        if cell_keys.is_empty() {
            return Ok(None);
        }
        let mut best: Option<(f64, f64, f64)> = None;
        for (key, _) in cell_keys {
            let row: Option<(f64, f64, f64)> = sqlx::query_as(
                "select lat, lon, radius from cell_prior
                 where radio = $1 and country = $2 and network = $3 and area = $4 and cell = $5 and unit = $6",
            )
            .bind(key.radio as i16)
            .bind(key.country)
            .bind(key.network)
            .bind(key.area)
            .bind(key.cell)
            .bind(key.unit)
            .fetch_optional(&self.geoip_pool)
            .await
            .map_err(crate::error::AppError::from)?;

            if let Some((lat, lon, radius)) = row {
                if best.map(|(_, _, r)| radius < r).unwrap_or(true) {
                    best = Some((lat, lon, radius));
                }
            }
        }
        Ok(best.map(|(lat, lon, radius)| LocateResponse {
            location: Location { longitude: lon, latitude: lat, altitude: None },
            accuracy: radius,
        }))
    }
}

fn weighted_centroid(points: &[Resolved]) -> (f64, f64) {
    let mut total_w = 0.0;
    let mut lat_acc = 0.0;
    let mut lon_acc = 0.0;
    for p in points {
        let c = 1.0 / p.accuracy.max(DISTANCE_EPSILON_M);
        let w = weight(p.strength_dbm as f64) * c;
        total_w += w;
        lat_acc += p.lat * w;
        lon_acc += p.lon * w;
    }
    (lat_acc / total_w, lon_acc / total_w)
}

/// Discards the 10% of points farthest from `centroid`, keeping at least
/// one and skipping trimming entirely at 3 or fewer points (spec §4.5 step
/// 5, §8 property 7).
fn trim_outliers(points: &[Resolved], centroid: (f64, f64)) -> Vec<&Resolved> {
    if points.len() <= 3 {
        return points.iter().collect();
    }
    let mut with_dist: Vec<(&Resolved, f64)> = points
        .iter()
        .map(|p| (p, equirect_distance_m(p.lat, p.lon, centroid.0, centroid.1)))
        .collect();
    with_dist.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

    let drop = (points.len() as f64 * 0.1).floor() as usize;
    let keep = (points.len() - drop).max(1);
    with_dist.into_iter().take(keep).map(|(p, _)| p).collect()
}

fn rms_accuracy(points: &[&Resolved], centroid: (f64, f64)) -> f64 {
    let mut total_w = 0.0;
    let mut sq_acc = 0.0;
    let mut max_single_accuracy: f64 = 0.0;
    for p in points {
        let c = 1.0 / p.accuracy.max(DISTANCE_EPSILON_M);
        let w = weight(p.strength_dbm as f64) * c;
        let d = equirect_distance_m(p.lat, p.lon, centroid.0, centroid.1);
        total_w += w;
        sq_acc += w * d * d;
        max_single_accuracy = max_single_accuracy.max(p.accuracy);
    }
    let rms = if total_w > 0.0 { (sq_acc / total_w).sqrt() } else { 0.0 };
    rms.max(MIN_ACCURACY_M).min(max_single_accuracy.max(MIN_ACCURACY_M))
}

fn equirect_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat_mid = (lat1 + lat2) / 2.0;
    let dx = (lon1 - lon2).to_radians() * lat_mid.to_radians().cos() * EARTH_RADIUS_M;
    let dy = (lat1 - lat2).to_radians() * EARTH_RADIUS_M;
    (dx * dx + dy * dy).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(lat: f64, lon: f64, accuracy: f64, strength_dbm: i16) -> Resolved {
        Resolved { lat, lon, accuracy, strength_dbm }
    }

    #[test]
    fn weighted_centroid_of_identical_points_is_that_point() {
        let points = vec![point(56.0, 37.0, 20.0, -80), point(56.0, 37.0, 30.0, -70)];
        let (lat, lon) = weighted_centroid(&points);
        assert!((lat - 56.0).abs() < 1e-9);
        assert!((lon - 37.0).abs() < 1e-9);
    }

    #[test]
    fn trimming_is_skipped_at_three_or_fewer_points() {
        let points = vec![point(56.0, 37.0, 20.0, -80), point(56.1, 37.1, 20.0, -80), point(90.0, 0.0, 20.0, -80)];
        let trimmed = trim_outliers(&points, (56.0, 37.0));
        assert_eq!(trimmed.len(), 3);
    }

    #[test]
    fn trimming_drops_the_farthest_tenth_above_three_points() {
        let mut points: Vec<Resolved> = (0..10).map(|i| point(56.0 + i as f64 * 0.001, 37.0, 20.0, -80)).collect();
        points.push(point(10.0, 10.0, 20.0, -80));
        let centroid = weighted_centroid(&points);
        let trimmed = trim_outliers(&points, centroid);
        assert_eq!(trimmed.len(), 10);
        assert!(trimmed.iter().all(|p| (p.lat - 10.0).abs() > 1.0 || p.lon != 10.0));
    }

    #[test]
    fn rms_accuracy_is_floored_at_ten_meters() {
        let p = point(56.0, 37.0, 5.0, -80);
        let points = vec![&p];
        let accuracy = rms_accuracy(&points, (56.0, 37.0));
        assert_eq!(accuracy, MIN_ACCURACY_M);
    }
}
