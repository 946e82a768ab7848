//! The Emitter Store (C3, spec §4.3): per-kind weighted aggregates with
//! batched upsert and keyed lookup.
//!
//! Unlike the rest of the teacher lineage, which leans on `sqlx::query!`/
//! `query_as!` compile-time verification against a live database, this
//! module uses the runtime-checked `sqlx::query`/`query_as` forms: there is
//! no `sqlx-data.json` checked into this repository to verify the macros
//! offline, and a live database is not available while building it. The
//! SQL is otherwise written exactly as the macro form would require.

use std::collections::{BTreeMap, HashMap};

use mac_address::MacAddress;
use sqlx::PgPool;

use crate::bounds::{weight, EmitterAggregate};
use crate::model::{CellKey, EmitterKey};

/// One raw observation destined for an emitter's aggregate: the reporter's
/// GNSS truth and the emitter's reported strength (spec §3 "Observation").
#[derive(Debug, Clone, Copy)]
pub struct Delta {
    pub lat: f64,
    pub lon: f64,
    pub strength_dbm: i16,
}

/// A `wifi`/`bluetooth` row, keyed by MAC. Decoded as one struct (rather
/// than a `(MacAddress, EmitterAggregate)` tuple) since sqlx's tuple
/// `FromRow` impls decode one column per position and can't span a nested
/// struct's column range.
#[derive(sqlx::FromRow)]
struct MacRow {
    mac: MacAddress,
    #[sqlx(flatten)]
    aggregate: EmitterAggregate,
}

pub struct EmitterStore {
    pool: PgPool,
}

impl EmitterStore {
    pub fn new(pool: PgPool) -> Self {
        EmitterStore { pool }
    }

    /// Batched keyed lookup (spec §4.3 `get_many`). Missing keys are simply
    /// absent from the result.
    pub async fn get_many(
        &self,
        keys: &[EmitterKey],
    ) -> Result<HashMap<EmitterKey, EmitterAggregate>, sqlx::Error> {
        let mut out = HashMap::new();

        let wifi_macs: Vec<MacAddress> = keys
            .iter()
            .filter_map(|k| match k {
                EmitterKey::Wifi(m) => Some(*m),
                _ => None,
            })
            .collect();
        if !wifi_macs.is_empty() {
            let rows: Vec<MacRow> = sqlx::query_as(
                "select mac, min_lat, min_lon, max_lat, max_lon, lat, lon, accuracy, total_weight, min_strength, max_strength from wifi where mac = any($1)",
            )
            .bind(&wifi_macs)
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                out.insert(EmitterKey::Wifi(row.mac), row.aggregate);
            }
        }

        let bt_macs: Vec<MacAddress> = keys
            .iter()
            .filter_map(|k| match k {
                EmitterKey::Bluetooth(m) => Some(*m),
                _ => None,
            })
            .collect();
        if !bt_macs.is_empty() {
            let rows: Vec<MacRow> = sqlx::query_as(
                "select mac, min_lat, min_lon, max_lat, max_lon, lat, lon, accuracy, total_weight, min_strength, max_strength from bluetooth where mac = any($1)",
            )
            .bind(&bt_macs)
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                out.insert(EmitterKey::Bluetooth(row.mac), row.aggregate);
            }
        }

        // Cell keys are composite; a typical query carries at most a
        // handful, so one lookup per key keeps the SQL simple rather than
        // building a dynamic `unnest` join for a rarely-large list.
        for key in keys {
            if let EmitterKey::Cell(cell) = key {
                let row: Option<EmitterAggregate> = sqlx::query_as(
                    "select min_lat, min_lon, max_lat, max_lon, lat, lon, accuracy, total_weight, min_strength, max_strength
                     from cell where radio = $1 and country = $2 and network = $3 and area = $4 and cell = $5 and unit = $6",
                )
                .bind(cell.radio as i16)
                .bind(cell.country)
                .bind(cell.network)
                .bind(cell.area)
                .bind(cell.cell)
                .bind(cell.unit)
                .fetch_optional(&self.pool)
                .await?;
                if let Some(agg) = row {
                    out.insert(*key, agg);
                }
            }
        }

        Ok(out)
    }

    /// Batched upsert (spec §4.3 `upsert_many`). Deltas are grouped by key
    /// and folded locally first, so a batch with repeated observations of
    /// the same emitter costs one round-trip per key. Runs inside the
    /// caller's transaction so it composes with the aggregation worker's
    /// single end-to-end transaction (spec §4.4).
    pub async fn upsert_many(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        updates: Vec<(EmitterKey, Delta)>,
    ) -> Result<(), sqlx::Error> {
        let mut folded: BTreeMap<EmitterKey, EmitterAggregate> = BTreeMap::new();
        for (key, delta) in updates {
            folded
                .entry(key)
                .and_modify(|agg| agg.update(delta.lat, delta.lon, delta.strength_dbm))
                .or_insert_with(|| EmitterAggregate::new(delta.lat, delta.lon, delta.strength_dbm));
        }

        for (key, agg) in folded {
            match key {
                EmitterKey::Wifi(mac) => upsert_mac(tx, "wifi", mac, &agg).await?,
                EmitterKey::Bluetooth(mac) => upsert_mac(tx, "bluetooth", mac, &agg).await?,
                EmitterKey::Cell(cell) => upsert_cell(tx, &cell, &agg).await?,
            }
        }

        Ok(())
    }
}

/// Incrementally merges `agg` (the batch-local fold) into the stored row.
/// The weighted mean and the accuracy recomputation happen in SQL against
/// whatever is already persisted, so two workers upserting the same key in
/// different batches still converge (spec §8 property 1).
async fn upsert_mac(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    table: &str,
    mac: MacAddress,
    agg: &EmitterAggregate,
) -> Result<(), sqlx::Error> {
    let sql = format!(
        "insert into {table} (mac, min_lat, min_lon, max_lat, max_lon, lat, lon, accuracy, total_weight, min_strength, max_strength)
         values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
         on conflict (mac) do update set
           min_lat = least({table}.min_lat, excluded.min_lat),
           min_lon = least({table}.min_lon, excluded.min_lon),
           max_lat = greatest({table}.max_lat, excluded.max_lat),
           max_lon = greatest({table}.max_lon, excluded.max_lon),
           lat = ({table}.lat * {table}.total_weight + excluded.lat * excluded.total_weight) / ({table}.total_weight + excluded.total_weight),
           lon = ({table}.lon * {table}.total_weight + excluded.lon * excluded.total_weight) / ({table}.total_weight + excluded.total_weight),
           total_weight = {table}.total_weight + excluded.total_weight,
           min_strength = least({table}.min_strength, excluded.min_strength),
           max_strength = greatest({table}.max_strength, excluded.max_strength),
           accuracy = sqrt(
             power(radians(greatest({table}.max_lon, excluded.max_lon) - least({table}.min_lon, excluded.min_lon))
                   * cos(radians((least({table}.min_lat, excluded.min_lat) + greatest({table}.max_lat, excluded.max_lat)) / 2.0))
                   * 6371008.8, 2)
             + power(radians(greatest({table}.max_lat, excluded.max_lat) - least({table}.min_lat, excluded.min_lat)) * 6371008.8, 2)
           ) / 2.0"
    );
    sqlx::query(&sql)
        .bind(mac)
        .bind(agg.min_lat)
        .bind(agg.min_lon)
        .bind(agg.max_lat)
        .bind(agg.max_lon)
        .bind(agg.lat)
        .bind(agg.lon)
        .bind(agg.accuracy)
        .bind(agg.total_weight)
        .bind(agg.min_strength)
        .bind(agg.max_strength)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn upsert_cell(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    cell: &CellKey,
    agg: &EmitterAggregate,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "insert into cell (radio, country, network, area, cell, unit, min_lat, min_lon, max_lat, max_lon, lat, lon, accuracy, total_weight, min_strength, max_strength)
         values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
         on conflict (radio, country, network, area, cell, unit) do update set
           min_lat = least(cell.min_lat, excluded.min_lat),
           min_lon = least(cell.min_lon, excluded.min_lon),
           max_lat = greatest(cell.max_lat, excluded.max_lat),
           max_lon = greatest(cell.max_lon, excluded.max_lon),
           lat = (cell.lat * cell.total_weight + excluded.lat * excluded.total_weight) / (cell.total_weight + excluded.total_weight),
           lon = (cell.lon * cell.total_weight + excluded.lon * excluded.total_weight) / (cell.total_weight + excluded.total_weight),
           total_weight = cell.total_weight + excluded.total_weight,
           min_strength = least(cell.min_strength, excluded.min_strength),
           max_strength = greatest(cell.max_strength, excluded.max_strength),
           accuracy = sqrt(
             power(radians(greatest(cell.max_lon, excluded.max_lon) - least(cell.min_lon, excluded.min_lon))
                   * cos(radians((least(cell.min_lat, excluded.min_lat) + greatest(cell.max_lat, excluded.max_lat)) / 2.0))
                   * 6371008.8, 2)
             + power(radians(greatest(cell.max_lat, excluded.max_lat) - least(cell.min_lat, excluded.min_lat)) * 6371008.8, 2)
           ) / 2.0",
    )
    .bind(cell.radio as i16)
    .bind(cell.country)
    .bind(cell.network)
    .bind(cell.area)
    .bind(cell.cell)
    .bind(cell.unit)
    .bind(agg.min_lat)
    .bind(agg.min_lon)
    .bind(agg.max_lat)
    .bind(agg.max_lon)
    .bind(agg.lat)
    .bind(agg.lon)
    .bind(agg.accuracy)
    .bind(agg.total_weight)
    .bind(agg.min_strength)
    .bind(agg.max_strength)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_local_deltas_matches_sequential_update() {
        let mut folded: BTreeMap<EmitterKey, EmitterAggregate> = BTreeMap::new();
        let key = EmitterKey::Wifi("50:ff:20:ec:90:d7".parse().unwrap());
        let deltas = [
            Delta { lat: 56.0112, lon: 37.4765, strength_dbm: -81 },
            Delta { lat: 56.0113, lon: 37.4766, strength_dbm: -73 },
        ];
        for delta in deltas {
            folded
                .entry(key)
                .and_modify(|agg| agg.update(delta.lat, delta.lon, delta.strength_dbm))
                .or_insert_with(|| EmitterAggregate::new(delta.lat, delta.lon, delta.strength_dbm));
        }
        let agg = folded.get(&key).unwrap();
        assert_eq!(agg.total_weight, weight(-81.0) + weight(-73.0));
        assert!(agg.min_lat <= agg.lat && agg.lat <= agg.max_lat);
    }

    #[sqlx::test]
    async fn upsert_then_get_many_round_trips_a_wifi_emitter(pool: PgPool) -> sqlx::Result<()> {
        let store = EmitterStore::new(pool.clone());
        let mac: MacAddress = "50:ff:20:ec:90:d7".parse().unwrap();
        let key = EmitterKey::Wifi(mac);

        let mut tx = pool.begin().await?;
        store
            .upsert_many(&mut tx, vec![(key, Delta { lat: 56.0112, lon: 37.4765, strength_dbm: -81 })])
            .await?;
        tx.commit().await?;

        let found = store.get_many(&[key]).await?;
        let agg = found.get(&key).expect("row should exist after upsert");
        assert!((agg.lat - 56.0112).abs() < 1e-9);
        assert!((agg.lon - 37.4765).abs() < 1e-9);
        assert_eq!(agg.total_weight, weight(-81.0));
        Ok(())
    }

    /// Two upserts of the same key across separate batches (and separate
    /// transactions) must converge the same as one batch with both deltas,
    /// matching spec §8 property 1 "exactly-once aggregation" at the
    /// storage layer's commutativity boundary.
    #[sqlx::test]
    async fn repeated_upserts_accumulate_weight_across_batches(pool: PgPool) -> sqlx::Result<()> {
        let store = EmitterStore::new(pool.clone());
        let mac: MacAddress = "5c:a6:e6:69:e5:ec".parse().unwrap();
        let key = EmitterKey::Wifi(mac);

        for (lat, lon, strength) in [(56.0112, 37.4765, -81i16), (56.0113, 37.4766, -73)] {
            let mut tx = pool.begin().await?;
            store.upsert_many(&mut tx, vec![(key, Delta { lat, lon, strength_dbm: strength })]).await?;
            tx.commit().await?;
        }

        let found = store.get_many(&[key]).await?;
        let agg = found.get(&key).unwrap();
        assert!((agg.total_weight - (weight(-81.0) + weight(-73.0))).abs() < 1e-9);
        assert!(agg.min_lat <= agg.lat && agg.lat <= agg.max_lat);
        assert!(agg.min_lon <= agg.lon && agg.lon <= agg.max_lon);
        Ok(())
    }

    #[sqlx::test]
    async fn get_many_omits_keys_absent_from_the_store(pool: PgPool) -> sqlx::Result<()> {
        let store = EmitterStore::new(pool);
        let mac: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let found = store.get_many(&[EmitterKey::Wifi(mac)]).await?;
        assert!(found.is_empty());
        Ok(())
    }
}
