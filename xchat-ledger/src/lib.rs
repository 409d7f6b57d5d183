use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("chain broken at line {line}: {reason}")]
    Chain { line: usize, reason: String },
}

/// One line of the ledger.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub record_id: Uuid,
    pub timestamp: String,
    pub kind: String,
    pub payload: Value,
    pub prev_hash: Option<String>,
    pub chain_hash: String,
}

/// Append-only JSONL file where each record hashes its predecessor.
pub struct Ledger {
    path: PathBuf,
    last_hash: Mutex<Option<String>>,
}

impl Ledger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let last_hash = read_records(&path)?.last().map(|r| r.chain_hash.clone());
        Ok(Self {
            path,
            last_hash: Mutex::new(last_hash),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, kind: &str, payload: Value) -> Result<LedgerRecord, LedgerError> {
        let mut last = self.last_hash.lock().map_err(|_| LedgerError::Io("lock".into()))?;
        let mut record = LedgerRecord {
            record_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            kind: kind.to_string(),
            payload,
            prev_hash: last.clone(),
            chain_hash: String::new(),
        };
        record.chain_hash = hash_record(&record);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LedgerError::Io(e.to_string()))?;
        let line = serde_json::to_string(&record).map_err(|e| LedgerError::Parse(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| LedgerError::Io(e.to_string()))?;
        *last = Some(record.chain_hash.clone());
        Ok(record)
    }
}

/// Check every link of the chain. Returns the number of records.
pub fn verify_log(path: impl AsRef<Path>) -> Result<usize, LedgerError> {
    let records = read_records(path.as_ref())?;
    let mut prev: Option<String> = None;
    for (i, record) in records.iter().enumerate() {
        if record.prev_hash != prev {
            return Err(LedgerError::Chain {
                line: i + 1,
                reason: "prev_hash does not match previous record".into(),
            });
        }
        if record.chain_hash != hash_record(record) {
            return Err(LedgerError::Chain {
                line: i + 1,
                reason: "chain_hash invalid".into(),
            });
        }
        prev = Some(record.chain_hash.clone());
    }
    Ok(records.len())
}

/// Last `n` records, oldest first.
pub fn tail(path: impl AsRef<Path>, n: usize) -> Result<Vec<LedgerRecord>, LedgerError> {
    let mut records = read_records(path.as_ref())?;
    let skip = records.len().saturating_sub(n);
    Ok(records.split_off(skip))
}

fn hash_record(record: &LedgerRecord) -> String {
    let mut h = Sha256::new();
    h.update(record.record_id.to_string());
    h.update(&record.timestamp);
    h.update(&record.kind);
    h.update(record.payload.to_string());
    if let Some(prev) = &record.prev_hash {
        h.update(prev);
    }
    format!("{:x}", h.finalize())
}

fn read_records(path: &Path) -> Result<Vec<LedgerRecord>, LedgerError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).map_err(|e| LedgerError::Io(e.to_string()))?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| LedgerError::Io(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: LedgerRecord =
            serde_json::from_str(&line).map_err(|e| LedgerError::Parse(e.to_string()))?;
        out.push(record);
    }
    Ok(out)
}

/// Fire-and-forget sink for telemetry events and user feedback.
///
/// Implementations must not fail the caller; write errors are logged and
/// dropped.
pub trait EventSink: Send + Sync {
    fn record(&self, kind: &str, payload: Value);
}

impl EventSink for Ledger {
    fn record(&self, kind: &str, payload: Value) {
        if let Err(e) = self.append(kind, payload) {
            tracing::warn!(kind, error = %e, path = %self.path.display(), "ledger append failed");
        }
    }
}

pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _kind: &str, _payload: Value) {}
}

/// Keeps events in memory. Used by tests and the CLI demo.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<(String, Value)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, Value)> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn kinds(&self) -> Vec<String> {
        self.events().into_iter().map(|(k, _)| k).collect()
    }
}

impl EventSink for MemorySink {
    fn record(&self, kind: &str, payload: Value) {
        let mut events = self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        events.push((kind.to_string(), payload));
    }
}
