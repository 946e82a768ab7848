//! Geospatial bounding boxes, the weight function, and the weighted
//! incremental aggregate maintained per emitter (spec §3, §4.3).

use serde::Serialize;

/// Mean Earth radius used for the equirectangular accuracy approximation
/// (spec §4.3), WGS84 convention.
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Reference power for the weight function (spec §4.3).
const WEIGHT_REF_DBM: f64 = -100.0;
const WEIGHT_MIN: f64 = 1e-4;
const WEIGHT_MAX: f64 = 1.0;

/// `w(strength)`: a monotone-increasing, strictly-positive function of
/// received power, clamped into `[WEIGHT_MIN, WEIGHT_MAX]` (spec §4.3,
/// testable property 5).
pub fn weight(strength_dbm: f64) -> f64 {
    let w = 10f64.powf((strength_dbm - WEIGHT_REF_DBM) / 10.0);
    w.clamp(WEIGHT_MIN, WEIGHT_MAX)
}

/// A geospatial bounding box.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bounds {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl Bounds {
    pub fn point(lat: f64, lon: f64) -> Self {
        Bounds {
            min_lat: lat,
            min_lon: lon,
            max_lat: lat,
            max_lon: lon,
        }
    }

    /// Widen the box, if needed, to include `(lat, lon)`.
    pub fn extend(&mut self, lat: f64, lon: f64) {
        self.min_lat = self.min_lat.min(lat);
        self.max_lat = self.max_lat.max(lat);
        self.min_lon = self.min_lon.min(lon);
        self.max_lon = self.max_lon.max(lon);
    }

    /// Half-diagonal of the box in meters, via the equirectangular
    /// approximation (spec §4.3): `dx = Δlon·cos(lat_mid)·R`, `dy = Δlat·R`.
    pub fn half_diagonal_m(&self) -> f64 {
        let lat_mid = (self.min_lat + self.max_lat) / 2.0;
        let dx = (self.max_lon - self.min_lon).to_radians() * lat_mid.to_radians().cos() * EARTH_RADIUS_M;
        let dy = (self.max_lat - self.min_lat).to_radians() * EARTH_RADIUS_M;
        (dx * dx + dy * dy).sqrt() / 2.0
    }
}

/// The per-emitter weighted aggregate described in spec §3: bounding box,
/// weighted centroid, accuracy radius, running weight, and signal-strength
/// envelope.
#[derive(Debug, Clone, Copy, Serialize, sqlx::FromRow)]
pub struct EmitterAggregate {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
    pub lat: f64,
    pub lon: f64,
    pub accuracy: f64,
    pub total_weight: f64,
    pub min_strength: i16,
    pub max_strength: i16,
}

impl EmitterAggregate {
    /// Create a fresh aggregate around a single observation (spec §4.3:
    /// "If the key is new").
    pub fn new(lat: f64, lon: f64, strength_dbm: i16) -> Self {
        EmitterAggregate {
            min_lat: lat,
            min_lon: lon,
            max_lat: lat,
            max_lon: lon,
            lat,
            lon,
            accuracy: 0.0,
            total_weight: weight(strength_dbm as f64),
            min_strength: strength_dbm,
            max_strength: strength_dbm,
        }
    }

    /// Fold in another observation: extend the box, update the weighted
    /// incremental mean, widen the strength envelope, and recompute
    /// accuracy from the (possibly wider) box (spec §4.3, §8 properties
    /// 2 and 3).
    pub fn update(&mut self, lat: f64, lon: f64, strength_dbm: i16) {
        let mut bounds = Bounds {
            min_lat: self.min_lat,
            min_lon: self.min_lon,
            max_lat: self.max_lat,
            max_lon: self.max_lon,
        };
        bounds.extend(lat, lon);
        self.min_lat = bounds.min_lat;
        self.min_lon = bounds.min_lon;
        self.max_lat = bounds.max_lat;
        self.max_lon = bounds.max_lon;

        let w = weight(strength_dbm as f64);
        let new_total = self.total_weight + w;
        self.lat = (self.lat * self.total_weight + lat * w) / new_total;
        self.lon = (self.lon * self.total_weight + lon * w) / new_total;
        self.total_weight = new_total;

        self.min_strength = self.min_strength.min(strength_dbm);
        self.max_strength = self.max_strength.max(strength_dbm);

        self.accuracy = bounds.half_diagonal_m();
    }
}

/// Checks the invariants spec §3/§8 require of a persisted aggregate:
/// the box contains the centroid, the weight is positive, and the strength
/// envelope is ordered. Called on read, at the boundary where a corrupted
/// row would otherwise leak into a response (spec §7 "Internal invariant").
pub fn check_invariants(agg: &EmitterAggregate) -> Result<(), String> {
    if !(agg.min_lat <= agg.lat && agg.lat <= agg.max_lat) {
        return Err(format!("latitude {} outside box [{}, {}]", agg.lat, agg.min_lat, agg.max_lat));
    }
    if !(agg.min_lon <= agg.lon && agg.lon <= agg.max_lon) {
        return Err(format!("longitude {} outside box [{}, {}]", agg.lon, agg.min_lon, agg.max_lon));
    }
    if agg.total_weight <= 0.0 {
        return Err(format!("total_weight {} is not positive", agg.total_weight));
    }
    if agg.min_strength > agg.max_strength {
        return Err(format!("min_strength {} exceeds max_strength {}", agg.min_strength, agg.max_strength));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_is_positive_and_clamped() {
        assert!(weight(-150.0) >= WEIGHT_MIN);
        assert!(weight(-150.0) > 0.0);
        assert!(weight(10.0) <= WEIGHT_MAX);
        assert_eq!(weight(-100.0), 1.0_f64.clamp(WEIGHT_MIN, WEIGHT_MAX));
    }

    #[test]
    fn weight_is_monotone() {
        assert!(weight(-90.0) > weight(-95.0));
        assert!(weight(-50.0) >= weight(-60.0));
    }

    #[test]
    fn box_contains_centroid_after_updates() {
        let mut agg = EmitterAggregate::new(56.0, 37.0, -80);
        agg.update(56.01, 37.02, -70);
        agg.update(55.99, 36.99, -90);

        assert!(agg.min_lat <= agg.lat && agg.lat <= agg.max_lat);
        assert!(agg.min_lon <= agg.lon && agg.lon <= agg.max_lon);
    }

    #[test]
    fn strength_envelope_is_monotone() {
        let mut agg = EmitterAggregate::new(0.0, 0.0, -80);
        agg.update(0.001, 0.001, -60);
        assert_eq!(agg.max_strength, -60);
        assert_eq!(agg.min_strength, -80);
        agg.update(0.002, 0.002, -95);
        assert_eq!(agg.min_strength, -95);
        assert_eq!(agg.max_strength, -60);
    }

    #[test]
    fn check_invariants_rejects_centroid_outside_box() {
        let mut agg = EmitterAggregate::new(56.0, 37.0, -80);
        agg.lat = 57.0;
        assert!(check_invariants(&agg).is_err());
    }

    #[test]
    fn check_invariants_rejects_nonpositive_weight() {
        let mut agg = EmitterAggregate::new(56.0, 37.0, -80);
        agg.total_weight = 0.0;
        assert!(check_invariants(&agg).is_err());
    }

    #[test]
    fn check_invariants_accepts_a_freshly_built_aggregate() {
        let mut agg = EmitterAggregate::new(56.0, 37.0, -80);
        agg.update(56.01, 37.01, -70);
        assert!(check_invariants(&agg).is_ok());
    }

    #[test]
    fn accuracy_grows_with_dispersion() {
        let mut agg = EmitterAggregate::new(56.0, 37.0, -80);
        assert_eq!(agg.accuracy, 0.0);
        agg.update(56.01, 37.01, -80);
        assert!(agg.accuracy > 0.0);
        let after_one = agg.accuracy;
        agg.update(56.5, 37.5, -80);
        assert!(agg.accuracy > after_one);
    }
}
