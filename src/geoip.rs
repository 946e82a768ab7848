//! IP-based coarse fallback (SPEC_FULL.md §B.1), adapted from the teacher's
//! `geoip` module. Gated behind `Config::ip_fallback`; disabled by default
//! so the documented spec §4.5 algorithm alone determines the response
//! unless an operator explicitly opts in.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use sqlx::PgPool;

pub struct GeoIpLookup {
    pool: PgPool,
}

#[derive(Debug, Clone, Copy)]
pub struct GeoIpEstimate {
    pub latitude: f64,
    pub longitude: f64,
}

/// Coarse accuracy assigned to an IP-range match: IP geolocation is
/// city-level at best, far looser than any radio-based estimate.
pub const GEOIP_ACCURACY_M: f64 = 25_000.0;

impl GeoIpLookup {
    pub fn new(pool: PgPool) -> Self {
        GeoIpLookup { pool }
    }

    pub async fn lookup(&self, addr: IpAddr) -> Result<Option<GeoIpEstimate>, sqlx::Error> {
        let network = IpNetwork::from(addr);
        let row: Option<(f64, f64)> = sqlx::query_as(
            "select latitude, longitude from geoip
             where range_start <= $1 and range_end >= $1
             order by (range_end - range_start) asc
             limit 1",
        )
        .bind(network)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(latitude, longitude)| GeoIpEstimate { latitude, longitude }))
    }
}
