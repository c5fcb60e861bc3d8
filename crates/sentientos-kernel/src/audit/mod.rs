//! Append-only, hash-chained audit log.
//!
//! Every entry carries the rolling hash of the previous entry, so the
//! JSON-lines file is tamper-evident without external infrastructure:
//! inserting, deleting or mutating any entry breaks the chain from that
//! point forward, and [`AuditChain::verify`] finds the first break.
//!
//! The kernel treats the chain as a write-only dependency. It never
//! reads its own log to make decisions, which prevents feedback loops
//! between what was logged and what is allowed. Each append is flushed
//! to disk before the operation that caused it returns, so a crash can
//! never lose an already-reported step's audit record.
//!
//! The log path is assumed single-writer per process. Concurrent writers
//! from multiple processes require external serialization that this
//! component does not provide.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};
use thiserror::Error;

use crate::crypto::{GENESIS_PREV_HASH, HashChainError, chain_hash, verify_chain_link};

/// Keys managed by the chain itself; payloads may not supply them.
const RESERVED_KEYS: &[&str] = &["timestamp", "prev_hash", "rolling_hash"];

/// Errors raised by audit chain operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditError {
    /// Filesystem failure while opening, appending or scanning.
    #[error("audit log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line in the log is not a JSON object.
    #[error("audit log line {line} is not a valid entry")]
    Malformed {
        /// 1-based line number.
        line: usize,
    },

    /// A payload tried to supply a chain-managed key.
    #[error("audit payload may not contain reserved key '{key}'")]
    ReservedKey {
        /// The offending key.
        key: String,
    },

    /// The chain does not verify from this line onward.
    #[error("audit chain broken at line {line}: {source}")]
    Broken {
        /// 1-based line number of the first bad entry.
        line: usize,
        /// The underlying link or hash failure.
        #[source]
        source: HashChainError,
    },
}

/// One entry of the audit chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    /// Append time, nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    /// Caller-supplied payload fields.
    pub payload: Map<String, Value>,
    /// Rolling hash of the previous entry (genesis for the first).
    pub prev_hash: String,
    /// Hash over `prev_hash || canonical({timestamp, ...payload})`.
    pub rolling_hash: String,
}

impl AuditEntry {
    /// Bytes the rolling hash commits to: the entry without its chain
    /// fields, serialized canonically.
    ///
    /// # Panics
    ///
    /// Panics if the in-memory entry fails to serialize, which
    /// `serde_json` guarantees cannot happen for `Value` maps. A hashed
    /// input must never silently degenerate to empty bytes.
    #[must_use]
    pub fn hashed_bytes(&self) -> Vec<u8> {
        let mut content = self.payload.clone();
        content.insert("timestamp".to_string(), Value::from(self.timestamp_ns));
        serde_json::to_vec(&Value::Object(content)).expect("in-memory audit entry serializes")
    }

    fn to_line(&self) -> Vec<u8> {
        let mut full = self.payload.clone();
        full.insert("timestamp".to_string(), Value::from(self.timestamp_ns));
        full.insert("prev_hash".to_string(), Value::from(self.prev_hash.clone()));
        full.insert(
            "rolling_hash".to_string(),
            Value::from(self.rolling_hash.clone()),
        );
        let mut bytes =
            serde_json::to_vec(&Value::Object(full)).expect("in-memory audit entry serializes");
        bytes.push(b'\n');
        bytes
    }

    fn from_value(value: Value, line: usize) -> Result<Self, AuditError> {
        let Value::Object(mut map) = value else {
            return Err(AuditError::Malformed { line });
        };
        let timestamp_ns = map
            .remove("timestamp")
            .and_then(|v| v.as_u64())
            .ok_or(AuditError::Malformed { line })?;
        let prev_hash = map
            .remove("prev_hash")
            .and_then(|v| v.as_str().map(ToString::to_string))
            .ok_or(AuditError::Malformed { line })?;
        let rolling_hash = map
            .remove("rolling_hash")
            .and_then(|v| v.as_str().map(ToString::to_string))
            .ok_or(AuditError::Malformed { line })?;
        Ok(Self {
            timestamp_ns,
            payload: map,
            prev_hash,
            rolling_hash,
        })
    }
}

/// Append-only log writer holding the last rolling hash.
#[derive(Debug)]
pub struct AuditChain {
    path: PathBuf,
    file: File,
    last_hash: String,
}

impl AuditChain {
    /// Opens (or creates) the chain at `path`, creating parent
    /// directories and resuming from the last entry's rolling hash.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] on I/O failure or a malformed existing log.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let last_hash = if path.exists() {
            Self::scan_last_hash(&path)?
        } else {
            GENESIS_PREV_HASH.to_string()
        };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            last_hash,
        })
    }

    /// The log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rolling hash of the most recent entry.
    #[must_use]
    pub fn last_hash(&self) -> &str {
        &self.last_hash
    }

    /// Appends a payload, durably, and returns the written entry.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::ReservedKey`] if the payload carries a
    /// chain-managed key, or [`AuditError::Io`] on write failure.
    pub fn append(&mut self, payload: Map<String, Value>) -> Result<AuditEntry, AuditError> {
        for key in RESERVED_KEYS {
            if payload.contains_key(*key) {
                return Err(AuditError::ReservedKey {
                    key: (*key).to_string(),
                });
            }
        }
        let timestamp_ns = now_ns();
        let mut entry = AuditEntry {
            timestamp_ns,
            payload,
            prev_hash: self.last_hash.clone(),
            rolling_hash: String::new(),
        };
        entry.rolling_hash = chain_hash(&entry.prev_hash, &entry.hashed_bytes());
        self.file.write_all(&entry.to_line())?;
        // Durability before the causing operation reports success.
        self.file.sync_data()?;
        self.last_hash = entry.rolling_hash.clone();
        Ok(entry)
    }

    /// Reads every entry back, in order.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] on I/O failure or malformed lines.
    pub fn read_entries(&self) -> Result<Vec<AuditEntry>, AuditError> {
        read_entries(&self.path)
    }

    /// Re-verifies the whole chain, returning the number of entries
    /// checked.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Broken`] at the first entry whose link or
    /// rolling hash does not verify.
    pub fn verify(&self) -> Result<usize, AuditError> {
        verify_chain_file(&self.path)
    }

    fn scan_last_hash(path: &Path) -> Result<String, AuditError> {
        let entries = read_entries(path)?;
        Ok(entries
            .last()
            .map_or_else(|| GENESIS_PREV_HASH.to_string(), |e| e.rolling_hash.clone()))
    }
}

/// Reads all entries from a chain file.
///
/// # Errors
///
/// Returns [`AuditError`] on I/O failure or malformed lines.
pub fn read_entries(path: &Path) -> Result<Vec<AuditEntry>, AuditError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value =
            serde_json::from_str(&line).map_err(|_| AuditError::Malformed { line: index + 1 })?;
        entries.push(AuditEntry::from_value(value, index + 1)?);
    }
    Ok(entries)
}

/// Verifies a chain file from genesis, returning the entry count.
///
/// # Errors
///
/// Returns [`AuditError::Broken`] at the first failing entry.
pub fn verify_chain_file(path: &Path) -> Result<usize, AuditError> {
    let entries = read_entries(path)?;
    let mut expected_prev = GENESIS_PREV_HASH.to_string();
    for (index, entry) in entries.iter().enumerate() {
        let line = index + 1;
        verify_chain_link(&entry.prev_hash, &expected_prev)
            .map_err(|source| AuditError::Broken { line, source })?;
        let computed = chain_hash(&entry.prev_hash, &entry.hashed_bytes());
        if computed != entry.rolling_hash {
            return Err(AuditError::Broken {
                line,
                source: HashChainError::HashMismatch {
                    expected: computed,
                    actual: entry.rolling_hash.clone(),
                },
            });
        }
        expected_prev = entry.rolling_hash.clone();
    }
    Ok(entries.len())
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
