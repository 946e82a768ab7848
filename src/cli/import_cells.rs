//! `beacond import-cells` (SPEC_FULL.md §B.3): bulk-loads the imported
//! coarse cell dataset (spec §3 "Imported coarse cell dataset") from a CSV
//! on stdin, in the MLS/Ichnaea export shape.

use std::io;

use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::PgPool;

use crate::model::{clamp_mcc_mnc, CellRadio};

#[derive(Debug, Deserialize)]
struct Record {
    radio: RadioType,
    mcc: i32,
    net: i32,
    area: i32,
    cell: i64,
    unit: Option<i16>,
    lon: f64,
    lat: f64,
    range: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum RadioType {
    Gsm,
    Umts,
    Lte,
    Nr,
}

impl From<RadioType> for CellRadio {
    fn from(r: RadioType) -> Self {
        match r {
            RadioType::Gsm => CellRadio::Gsm,
            RadioType::Umts => CellRadio::Wcdma,
            RadioType::Lte => CellRadio::Lte,
            RadioType::Nr => CellRadio::Nr,
        }
    }
}

/// Reads CSV records from stdin and upserts them into `cell_prior`.
pub async fn run(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await?;
    let mut reader = csv::Reader::from_reader(io::stdin());
    let mut count = 0usize;

    for result in reader.deserialize() {
        let record: Record = result?;
        let radio: CellRadio = record.radio.into();
        let unit = record.unit.unwrap_or(0);

        sqlx::query(
            "insert into cell_prior (radio, country, network, area, cell, unit, lat, lon, radius)
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             on conflict (radio, country, network, area, cell, unit) do update set
               lat = excluded.lat, lon = excluded.lon, radius = excluded.radius",
        )
        .bind(radio as i16)
        .bind(clamp_mcc_mnc(record.mcc))
        .bind(clamp_mcc_mnc(record.net))
        .bind(record.area)
        .bind(record.cell)
        .bind(unit)
        .bind(record.lat)
        .bind(record.lon)
        .bind(record.range)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to import record {count}"))?;

        count += 1;
        if count % 100_000 == 0 {
            println!("{count}");
        }
    }
    tx.commit().await?;
    println!("imported {count} cell priors");

    Ok(())
}
