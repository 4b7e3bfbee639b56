use crate::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Content-derived hash used for staleness checks.
///
/// Computation is a pure function of its inputs: identical command
/// text, dependency fingerprints, and external file digests always
/// produce an identical fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hash an ordered sequence of byte parts. Each part is length-
    /// prefixed so that part boundaries cannot collide.
    pub fn of_parts<'a, I>(parts: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Fingerprint(hasher.finalize().to_hex().to_string())
    }

    /// Fingerprint of a target: its command text plus the fingerprints
    /// of its dependencies in dependency-name order, plus the digests
    /// of any tracked external files.
    pub fn of_target(command: &str, dep_fps: &[&Fingerprint], file_digests: &[String]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(command.len() as u64).to_le_bytes());
        hasher.update(command.as_bytes());
        for fp in dep_fps {
            hasher.update(fp.as_str().as_bytes());
        }
        for digest in file_digests {
            hasher.update(digest.as_bytes());
        }
        Fingerprint(hasher.finalize().to_hex().to_string())
    }

    /// First 64 bits of the fingerprint as an integer, for seeding.
    pub fn as_seed(&self) -> u64 {
        let mut buf = [0u8; 8];
        let bytes = self.0.as_bytes();
        for (i, chunk) in bytes.chunks(2).take(8).enumerate() {
            let hex = std::str::from_utf8(chunk).unwrap_or("00");
            buf[i] = u8::from_str_radix(hex, 16).unwrap_or(0);
        }
        u64::from_le_bytes(buf)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0[..self.0.len().min(12)])
    }
}

/// Content digest of one external file. Large files fall back to a
/// size + modification-time digest to avoid rehashing gigabytes on
/// every staleness check.
pub fn file_digest(path: &Path) -> std::io::Result<String> {
    const CONTENT_HASH_LIMIT: u64 = 64 * 1024 * 1024;

    let meta = std::fs::metadata(path)?;
    if meta.len() > CONTENT_HASH_LIMIT {
        let mtime = meta
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let mut hasher = blake3::Hasher::new();
        hasher.update(&meta.len().to_le_bytes());
        hasher.update(&mtime.to_le_bytes());
        return Ok(hasher.finalize().to_hex().to_string());
    }

    let bytes = std::fs::read(path)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Canonical content digest of a value, used for slice identities.
/// Object fields are folded in ascending key order, so equal values
/// always digest equally regardless of map iteration order.
pub fn value_digest(value: &Value) -> String {
    let mut hasher = blake3::Hasher::new();
    fold_value(&mut hasher, value);
    hasher.finalize().to_hex().to_string()
}

fn fold_value(hasher: &mut blake3::Hasher, value: &Value) {
    fn fold_bytes(hasher: &mut blake3::Hasher, bytes: &[u8]) {
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }

    match value {
        Value::Null => {
            hasher.update(b"n");
        }
        Value::Bool(b) => {
            hasher.update(if *b { b"t" } else { b"f" });
        }
        Value::Number(n) => {
            hasher.update(b"d");
            hasher.update(&n.to_le_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            fold_bytes(hasher, s.as_bytes());
        }
        Value::Bytes(bytes) => {
            hasher.update(b"b");
            fold_bytes(hasher, bytes);
        }
        // serde_json's map keeps keys sorted, so its serialization is
        // already canonical.
        Value::Json(json) => {
            hasher.update(b"j");
            fold_bytes(hasher, &serde_json::to_vec(json).unwrap_or_default());
        }
        Value::Array(items) => {
            hasher.update(b"a");
            hasher.update(&(items.len() as u64).to_le_bytes());
            for item in items {
                fold_value(hasher, item);
            }
        }
        Value::Object(fields) => {
            hasher.update(b"o");
            hasher.update(&(fields.len() as u64).to_le_bytes());
            let mut keys: Vec<&String> = fields.keys().collect();
            keys.sort_unstable();
            for key in keys {
                fold_bytes(hasher, key.as_bytes());
                fold_value(hasher, &fields[key]);
            }
        }
    }
}

/// Terminal outcome stored in a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RecordOutcome {
    Succeeded,
    Skipped,
    Failed { kind: String, message: String },
}

impl RecordOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RecordOutcome::Succeeded | RecordOutcome::Skipped)
    }
}

/// Durable per-unit record in the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub name: String,
    pub fingerprint: Fingerprint,
    pub outcome: RecordOutcome,
    /// Storage location of the persisted value, if any
    pub location: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Seed used for `sample()` selection, recorded for reproducibility
    pub seed: Option<u64>,
    /// Ordered branch identities, present only for pattern targets
    pub branches: Option<Vec<String>>,
    /// (path, digest) pairs for file-format targets
    pub file_digests: Option<Vec<(String, String)>>,
}

impl Record {
    pub fn new(name: impl Into<String>, fingerprint: Fingerprint) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            fingerprint,
            outcome: RecordOutcome::Succeeded,
            location: None,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            seed: None,
            branches: None,
            file_digests: None,
        }
    }

    pub fn with_outcome(mut self, outcome: RecordOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.finished_at = Utc::now();
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_branches(mut self, branches: Vec<String>) -> Self {
        self.branches = Some(branches);
        self
    }

    pub fn with_file_digests(mut self, digests: Vec<(String, String)>) -> Self {
        self.file_digests = Some(digests);
        self
    }
}
