//! Stateless chart rendering: `(chart type, rows, config) -> plotly spec`.
//!
//! Nothing here performs I/O. Callers own the rows and get back a plain JSON
//! figure (`{data, layout}`) that any plotly front end can draw.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use xchat_types::Row;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChartError {
    #[error("unsupported chart type '{0}'")]
    UnsupportedChartType(String),
    #[error("chart config does not match data: {0}")]
    ConfigMismatch(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartType {
    Line,
    Scatter,
    Bar,
    Pie,
    Map,
}

impl ChartType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartType::Line => "line",
            ChartType::Scatter => "scatter",
            ChartType::Bar => "bar",
            ChartType::Pie => "pie",
            ChartType::Map => "map",
        }
    }
}

impl fmt::Display for ChartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChartType {
    type Err = ChartError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "line" => Ok(ChartType::Line),
            "scatter" => Ok(ChartType::Scatter),
            "bar" => Ok(ChartType::Bar),
            "pie" => Ok(ChartType::Pie),
            "map" | "scattergeo" => Ok(ChartType::Map),
            _ => Err(ChartError::UnsupportedChartType(s.to_string())),
        }
    }
}

/// One column name or several.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Columns {
    One(String),
    Many(Vec<String>),
}

impl Columns {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Columns::One(c) => vec![c.clone()],
            Columns::Many(cs) => cs.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<Columns>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<String>,
}

impl ChartConfig {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn x(mut self, column: impl Into<String>) -> Self {
        self.x = Some(column.into());
        self
    }

    pub fn y<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.y = Some(Columns::Many(columns.into_iter().map(Into::into).collect()));
        self
    }

    fn x_column(&self) -> &str {
        self.x.as_deref().unwrap_or("Date")
    }
}

/// Render `rows` as a plotly figure of the given chart type.
pub fn generate_chart(chart_type: &str, rows: &[Row], config: &ChartConfig) -> Result<Value, ChartError> {
    let kind: ChartType = chart_type.parse()?;
    let present = Present::of(rows);

    let (data, layout) = match kind {
        ChartType::Line | ChartType::Scatter | ChartType::Bar => {
            let x = config.x_column();
            let ys = y_columns(config, rows, x);
            present.require(x)?;
            for y in &ys {
                present.require(y)?;
            }
            let traces: Vec<Value> = ys.iter().map(|y| xy_trace(kind, rows, x, y)).collect();
            let layout = json!({
                "title": { "text": title(config, kind) },
                "xaxis": { "title": { "text": x } },
                "template": "plotly_white",
            });
            (traces, layout)
        }
        ChartType::Pie => {
            let labels = config.labels.as_deref().unwrap_or("label");
            let values = config.values.as_deref().unwrap_or("value");
            present.require(labels)?;
            present.require(values)?;
            let trace = json!({
                "type": "pie",
                "labels": column(rows, labels),
                "values": column(rows, values),
            });
            (vec![trace], json!({ "title": { "text": title(config, kind) }, "template": "plotly_white" }))
        }
        ChartType::Map => {
            let lat = config.lat.as_deref().unwrap_or("lat");
            let lon = config.lon.as_deref().unwrap_or("lon");
            present.require(lat)?;
            present.require(lon)?;
            let trace = json!({
                "type": "scattergeo",
                "mode": "markers",
                "lat": column(rows, lat),
                "lon": column(rows, lon),
                "marker": { "size": 8, "color": "blue", "opacity": 0.8 },
            });
            let layout = json!({
                "title": { "text": title(config, kind) },
                "geo": { "scope": "asia" },
                "template": "plotly_white",
            });
            (vec![trace], layout)
        }
    };

    Ok(json!({ "data": data, "layout": layout }))
}

/// Columns seen in the rows. An empty row set has nothing to contradict the
/// config with.
struct Present<'a> {
    columns: Option<BTreeSet<&'a str>>,
}

impl<'a> Present<'a> {
    fn of(rows: &'a [Row]) -> Self {
        if rows.is_empty() {
            return Self { columns: None };
        }
        let columns = rows.iter().flat_map(|r| r.keys().map(String::as_str)).collect();
        Self { columns: Some(columns) }
    }

    fn require(&self, column: &str) -> Result<(), ChartError> {
        match &self.columns {
            Some(cols) if !cols.contains(column) => Err(ChartError::ConfigMismatch(format!(
                "column '{column}' is not present in the data"
            ))),
            _ => Ok(()),
        }
    }
}

fn title(config: &ChartConfig, kind: ChartType) -> String {
    config.title.clone().unwrap_or_else(|| match kind {
        ChartType::Line => "Line Chart".into(),
        ChartType::Scatter => "Scatter Chart".into(),
        ChartType::Bar => "Bar Chart".into(),
        ChartType::Pie => "Pie Chart".into(),
        ChartType::Map => "Map Distribution".into(),
    })
}

/// Explicit `y`, otherwise every numeric column other than `x` in first-seen
/// order.
fn y_columns(config: &ChartConfig, rows: &[Row], x: &str) -> Vec<String> {
    if let Some(y) = &config.y {
        return y.to_vec();
    }
    let mut out: Vec<String> = Vec::new();
    for row in rows {
        for (k, v) in row {
            if k != x && v.is_number() && !out.contains(k) {
                out.push(k.clone());
            }
        }
    }
    out
}

fn column(rows: &[Row], name: &str) -> Vec<Value> {
    rows.iter()
        .map(|r| r.get(name).cloned().unwrap_or(Value::Null))
        .collect()
}

fn xy_trace(kind: ChartType, rows: &[Row], x: &str, y: &str) -> Value {
    let mut trace = json!({
        "x": column(rows, x),
        "y": column(rows, y),
        "name": y,
    });
    match kind {
        ChartType::Bar => trace["type"] = json!("bar"),
        ChartType::Scatter => {
            trace["type"] = json!("scatter");
            trace["mode"] = json!("markers");
        }
        _ => {
            trace["type"] = json!("scatter");
            trace["mode"] = json!("lines");
        }
    }
    trace
}
