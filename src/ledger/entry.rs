//! One line of the durable ledger.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::client::Caption;

/// Suffix appended to error messages cut by [`truncate_error`].
pub const TRUNCATION_MARKER: &str = "…[truncated]";

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Fail,
}

// ---------------------------------------------------------------------------
// LedgerEntry
// ---------------------------------------------------------------------------

/// Outcome of one processing attempt, serialised as a single JSON line.
///
/// `caption` and `usage` are present only on `ok` entries, `error` only on
/// `fail` entries.  Older ledgers keyed records by `idx`; that spelling is
/// accepted on read, as is a `-1` sample rate for "unknown".  Keys this
/// struct does not model are kept in `extra` and written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(alias = "idx")]
    pub id: u64,
    pub status: Status,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub processing_time: f64,
    #[serde(default = "first_attempt")]
    pub retry_attempt: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_duration: Option<f64>,
    #[serde(
        default,
        deserialize_with = "known_sample_rate",
        skip_serializing_if = "Option::is_none"
    )]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<u64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn first_attempt() -> u32 {
    1
}

/// Non-positive or out-of-range rates mean "unknown".
fn known_sample_rate<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<i64>::deserialize(deserializer)?;
    Ok(raw.filter(|r| *r > 0).and_then(|r| u32::try_from(r).ok()))
}

impl LedgerEntry {
    /// A successful attempt carrying the endpoint's caption and usage.
    pub fn success(id: u64, retry_attempt: u32, processing_time: f64, caption: Caption) -> Self {
        Self {
            id,
            status: Status::Ok,
            caption: Some(caption.text),
            usage: Some(caption.usage),
            error: None,
            processing_time,
            retry_attempt,
            audio_duration: None,
            sample_rate: None,
            mime_type: None,
            compressed_size: None,
            extra: Map::new(),
        }
    }

    /// A failed attempt.  `error` is stored as given; callers truncate it.
    pub fn failure(id: u64, retry_attempt: u32, processing_time: f64, error: String) -> Self {
        Self {
            id,
            status: Status::Fail,
            caption: None,
            usage: None,
            error: Some(error),
            processing_time,
            retry_attempt,
            audio_duration: None,
            sample_rate: None,
            mime_type: None,
            compressed_size: None,
            extra: Map::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

/// Cut `message` to at most `max_chars` characters plus [`TRUNCATION_MARKER`].
///
/// Counts characters, not bytes, so multi-byte text is never split.
pub fn truncate_error(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        None => message.to_string(),
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &message[..cut]),
    }
}

/// `<id>\t<caption>` with embedded line breaks collapsed to spaces and the
/// result trimmed.  No trailing newline.
pub fn tsv_line(id: u64, caption: &str) -> String {
    let flat: String = caption
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    format!("{id}\t{}", flat.trim())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
