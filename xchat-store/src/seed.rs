//! Demo tables used by the server and CLI when no external store is wired.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Local};
use serde_json::{json, Value};
use xchat_types::Row;

use crate::InMemoryDataSource;

pub const SALES_TABLE: &str = "sales_table";
pub const GEO_TABLE: &str = "user_geo_table";

/// An [`InMemoryDataSource`] holding a 30-day `sales_table` and a 100-point
/// `user_geo_table`. Values are deterministic.
pub async fn demo_source(latency: Duration) -> InMemoryDataSource {
    let source = InMemoryDataSource::new().with_latency(latency);
    source.replace_table(SALES_TABLE, sales_rows(30)).await;
    source.replace_table(GEO_TABLE, geo_rows(100)).await;
    source
}

pub fn sales_rows(days: usize) -> Vec<Row> {
    let today = Local::now().date_naive();
    (0..days)
        .map(|i| {
            let date = today - ChronoDuration::days((days - 1 - i) as i64);
            let t = i as f64;
            row(json!({
                "Date": date.format("%Y-%m-%d").to_string(),
                "Product A": round2(60.0 + 5.0 * (t * 0.7).sin()),
                "Product B": round2(70.0 + 4.0 * (t * 0.45).cos()),
                "Product C": round2(50.0 + 6.0 * (t * 0.3 + 1.0).sin()),
            }))
        })
        .collect()
}

pub fn geo_rows(points: usize) -> Vec<Row> {
    (0..points)
        .map(|i| {
            let a = ((i * 37) % 100) as f64 - 50.0;
            let b = ((i * 61) % 100) as f64 - 50.0;
            row(json!({
                "lat": round5(25.033 + a / 2500.0),
                "lon": round5(121.565 + b / 2500.0),
            }))
        })
        .collect()
}

fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round5(v: f64) -> f64 {
    (v * 100_000.0).round() / 100_000.0
}
