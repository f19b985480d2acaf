//! Core identifier types and clock helpers.

use crate::error::StorageError;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const MAX_ID_LEN: usize = 128;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Validated workbench identifier.
///
/// A non-empty token of ASCII letters, digits, `-` and `_`. Path separators, `.` and `..` can
/// never parse, so a `WorkbenchId` is always safe to join onto the workbenches root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WorkbenchId(String);

impl WorkbenchId {
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        if raw.is_empty()
            || raw.len() > MAX_ID_LEN
            || !raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(StorageError::InvalidWorkbenchId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn generate() -> Self {
        Self(new_id("wb"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkbenchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for WorkbenchId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        WorkbenchId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// RFC 3339 UTC timestamp with millisecond precision.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Sortable, process-unique identifier: `<prefix>-<millis>-<seq>`.
pub fn new_id(prefix: &str) -> String {
    let ts = now_millis();
    let seq = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{ts:013}-{seq:06}")
}
