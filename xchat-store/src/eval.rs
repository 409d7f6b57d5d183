//! Row-level evaluation of a [`QueryDescriptor`]: filter, group and
//! aggregate, project, paginate. Pure functions over an in-memory table.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use serde_json::{Number, Value};
use xchat_types::{AggOp, Filter, FilterOp, QueryDescriptor, Row};

use crate::GatewayError;

pub fn evaluate(
    rows: &[Row],
    known_columns: &[String],
    descriptor: &QueryDescriptor,
) -> Result<Vec<Row>, GatewayError> {
    for column in descriptor.referenced_columns() {
        if !known_columns.iter().any(|k| k == column) {
            return Err(GatewayError::InvalidDescriptor(format!(
                "unknown column '{column}' in '{}'",
                descriptor.raw_data_source
            )));
        }
    }
    for filter in &descriptor.filters {
        validate_filter(filter)?;
    }

    let filtered: Vec<&Row> = rows
        .iter()
        .filter(|row| descriptor.filters.iter().all(|f| matches(row, f)))
        .collect();

    let shaped: Vec<Row> = if descriptor.groupby.is_empty() && descriptor.aggregation.is_empty() {
        filtered.into_iter().cloned().collect()
    } else {
        for column in &descriptor.columns {
            if !descriptor.groupby.contains(column) && !descriptor.aggregation.contains_key(column) {
                return Err(GatewayError::InvalidDescriptor(format!(
                    "column '{column}' is neither grouped nor aggregated"
                )));
            }
        }
        group(&filtered, &descriptor.groupby, &descriptor.aggregation)
    };

    let projected = if descriptor.columns.is_empty() {
        shaped
    } else {
        shaped
            .into_iter()
            .map(|row| project(row, &descriptor.columns))
            .collect()
    };

    Ok(projected
        .into_iter()
        .skip(descriptor.offset)
        .take(descriptor.limit.unwrap_or(usize::MAX))
        .collect())
}

fn validate_filter(filter: &Filter) -> Result<(), GatewayError> {
    let ok = match filter.op {
        FilterOp::Eq | FilterOp::Ne => true,
        FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
            matches!(filter.value, Value::Number(_) | Value::String(_))
        }
        FilterOp::In => filter.value.is_array(),
        FilterOp::Contains => filter.value.is_string(),
    };
    if ok {
        Ok(())
    } else {
        Err(GatewayError::InvalidDescriptor(format!(
            "operator {:?} cannot take value {} on '{}'",
            filter.op, filter.value, filter.column
        )))
    }
}

fn matches(row: &Row, filter: &Filter) -> bool {
    let cell = row.get(&filter.column).unwrap_or(&Value::Null);
    match filter.op {
        FilterOp::Eq => values_equal(cell, &filter.value),
        FilterOp::Ne => !values_equal(cell, &filter.value),
        FilterOp::Gt => compare(cell, &filter.value) == Some(Ordering::Greater),
        FilterOp::Gte => matches!(
            compare(cell, &filter.value),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOp::Lt => compare(cell, &filter.value) == Some(Ordering::Less),
        FilterOp::Lte => matches!(
            compare(cell, &filter.value),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOp::In => filter
            .value
            .as_array()
            .map(|items| items.iter().any(|v| values_equal(cell, v)))
            .unwrap_or(false),
        FilterOp::Contains => {
            let needle = filter.value.as_str().unwrap_or_default();
            match cell {
                Value::String(s) => s.contains(needle),
                Value::Array(items) => items.iter().any(|v| v.as_str() == Some(needle)),
                _ => false,
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn group(rows: &[&Row], groupby: &[String], aggregation: &BTreeMap<String, AggOp>) -> Vec<Row> {
    // Groups keep first-seen order.
    let mut index: HashMap<Vec<String>, usize> = HashMap::new();
    let mut groups: Vec<(Vec<Value>, Vec<&Row>)> = Vec::new();

    for row in rows {
        let values: Vec<Value> = groupby
            .iter()
            .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        let key: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        match index.get(&key) {
            Some(&i) => groups[i].1.push(row),
            None => {
                index.insert(key, groups.len());
                groups.push((values, vec![row]));
            }
        }
    }

    // A global aggregate always yields one row, even over nothing.
    if groupby.is_empty() && groups.is_empty() {
        groups.push((Vec::new(), Vec::new()));
    }

    groups
        .into_iter()
        .map(|(values, members)| {
            let mut out = Row::new();
            for (column, value) in groupby.iter().zip(values) {
                out.insert(column.clone(), value);
            }
            for (column, op) in aggregation {
                out.insert(column.clone(), aggregate(&members, column, *op));
            }
            out
        })
        .collect()
}

fn aggregate(rows: &[&Row], column: &str, op: AggOp) -> Value {
    let cells: Vec<&Value> = rows
        .iter()
        .filter_map(|r| r.get(column))
        .filter(|v| !v.is_null())
        .collect();
    let nums: Vec<f64> = cells.iter().filter_map(|v| v.as_f64()).collect();
    let result = match op {
        AggOp::Count => return Value::from(cells.len() as u64),
        _ if nums.is_empty() => return Value::Null,
        AggOp::Sum => nums.iter().sum(),
        AggOp::Avg => nums.iter().sum::<f64>() / nums.len() as f64,
        AggOp::Min => nums.iter().copied().fold(f64::INFINITY, f64::min),
        AggOp::Max => nums.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    };
    Number::from_f64(result).map(Value::Number).unwrap_or(Value::Null)
}

fn project(mut row: Row, columns: &[String]) -> Row {
    let mut out = Row::new();
    for column in columns {
        if let Some(v) = row.remove(column) {
            out.insert(column.clone(), v);
        }
    }
    out
}
