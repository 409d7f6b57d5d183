use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// One materialized result row. Column order is preserved.
pub type Row = serde_json::Map<String, Value>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    #[serde(alias = "==")]
    Eq,
    #[serde(alias = "!=")]
    Ne,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Lte,
    In,
    Contains,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    #[serde(alias = "operator")]
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// Order-insensitive rendering of the filter value. `in` lists are
    /// treated as sets.
    fn canonical_value(&self) -> String {
        match (&self.op, &self.value) {
            (FilterOp::In, Value::Array(items)) => {
                let mut parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                parts.sort();
                parts.dedup();
                format!("[{}]", parts.join(","))
            }
            (_, v) => v.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggOp {
    Sum,
    #[serde(alias = "mean")]
    Avg,
    Min,
    Max,
    Count,
}

impl AggOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggOp::Sum => "sum",
            AggOp::Avg => "avg",
            AggOp::Min => "min",
            AggOp::Max => "max",
            AggOp::Count => "count",
        }
    }
}

/// Immutable description of one analytical read against a data source.
///
/// Two descriptors are equal when their canonical forms are equal: column,
/// filter and group-by order do not matter, but `columns` keeps its order so
/// the gateway can project rows in the order the caller asked for.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub raw_data_source: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub groupby: Vec<String>,
    #[serde(default)]
    pub aggregation: BTreeMap<String, AggOp>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl QueryDescriptor {
    pub fn new(raw_data_source: impl Into<String>) -> Self {
        Self {
            raw_data_source: raw_data_source.into(),
            ..Self::default()
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn filter(mut self, column: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::new(column, op, value));
        self
    }

    pub fn group_by(mut self, column: impl Into<String>) -> Self {
        self.groupby.push(column.into());
        self
    }

    pub fn aggregate(mut self, column: impl Into<String>, op: AggOp) -> Self {
        self.aggregation.insert(column.into(), op);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Every column the descriptor references, in first-seen order.
    pub fn referenced_columns(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        let all = self
            .columns
            .iter()
            .map(String::as_str)
            .chain(self.filters.iter().map(|f| f.column.as_str()))
            .chain(self.groupby.iter().map(String::as_str))
            .chain(self.aggregation.keys().map(String::as_str));
        for c in all {
            if !out.contains(&c) {
                out.push(c);
            }
        }
        out
    }

    pub fn canonical(&self) -> CanonicalQuery {
        let mut columns = self.columns.clone();
        columns.sort();
        columns.dedup();

        let mut filters: Vec<(String, FilterOp, String)> = self
            .filters
            .iter()
            .map(|f| (f.column.clone(), f.op, f.canonical_value()))
            .collect();
        filters.sort();
        filters.dedup();

        let mut groupby = self.groupby.clone();
        groupby.sort();
        groupby.dedup();

        CanonicalQuery {
            source: self.raw_data_source.clone(),
            columns,
            filters,
            groupby,
            aggregation: self.aggregation.clone(),
            limit: self.limit,
            offset: self.offset,
        }
    }

    /// Stable cache key: SHA-256 over the canonical form.
    pub fn cache_key(&self) -> CacheKey {
        self.canonical().key()
    }
}

impl PartialEq for QueryDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for QueryDescriptor {}

/// Order-normalized form of a [`QueryDescriptor`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct CanonicalQuery {
    pub source: String,
    pub columns: Vec<String>,
    pub filters: Vec<(String, FilterOp, String)>,
    pub groupby: Vec<String>,
    pub aggregation: BTreeMap<String, AggOp>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl CanonicalQuery {
    pub fn key(&self) -> CacheKey {
        let mut h = Sha256::new();
        h.update(self.source.as_bytes());
        h.update([0x1e]);
        for c in &self.columns {
            h.update(c.as_bytes());
            h.update([0x1f]);
        }
        h.update([0x1e]);
        for (column, op, value) in &self.filters {
            h.update(column.as_bytes());
            h.update([0x1f]);
            h.update(format!("{op:?}").as_bytes());
            h.update([0x1f]);
            h.update(value.as_bytes());
            h.update([0x1f]);
        }
        h.update([0x1e]);
        for g in &self.groupby {
            h.update(g.as_bytes());
            h.update([0x1f]);
        }
        h.update([0x1e]);
        for (column, op) in &self.aggregation {
            h.update(column.as_bytes());
            h.update([0x1f]);
            h.update(op.as_str().as_bytes());
            h.update([0x1f]);
        }
        h.update([0x1e]);
        match self.limit {
            Some(limit) => h.update(limit.to_le_bytes()),
            None => h.update(b"none"),
        }
        h.update(self.offset.to_le_bytes());
        CacheKey(format!("{:x}", h.finalize()))
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(pub String);

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to correlate log lines.
        let short = self.0.get(..12).unwrap_or(&self.0);
        f.write_str(short)
    }
}

/// Cheap-to-read watermark of a data source. Entries cached under one token
/// are only served while the source still reports the same token.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FreshnessToken(pub u64);

impl fmt::Display for FreshnessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}
