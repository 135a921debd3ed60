//! Job records as stored in the local cache and exchanged with the remote job store.
//!
//! Remote payloads are loose: timestamps arrive as epoch milliseconds or ISO strings,
//! the download location under two spellings, warnings as a string or a list. All of
//! that is folded into one shape here, at deserialization time, so nothing past this
//! module ever sees the alternatives.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeSet;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawJobRecord")]
pub struct JobRecord {
    pub id: String,
    pub created_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub template: String,
    pub options: OptionSet,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

/// A record as it arrives. The job store echoes whatever body it was given, so a
/// payload may carry the download location under either spelling, or both.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawJobRecord {
    #[serde(deserialize_with = "de_job_id")]
    id: String,
    #[serde(default)]
    created_at: Timestamp,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    template: String,
    #[serde(default)]
    options: OptionSet,
    #[serde(default, deserialize_with = "de_warnings")]
    warnings: Vec<String>,
    #[serde(default)]
    download_url: Option<String>,
    #[serde(default, rename = "download_url")]
    download_url_snake: Option<String>,
}

impl From<RawJobRecord> for JobRecord {
    fn from(raw: RawJobRecord) -> Self {
        let download_url = raw
            .download_url
            .into_iter()
            .chain(raw.download_url_snake)
            .find(|u| !u.trim().is_empty());
        Self {
            id: raw.id,
            created_at: raw.created_at,
            filename: raw.filename,
            size: raw.size,
            template: raw.template,
            options: raw.options,
            warnings: raw.warnings,
            download_url,
        }
    }
}

impl JobRecord {
    pub fn new(id: impl Into<String>, created_at: Timestamp, template: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at,
            filename: None,
            size: None,
            template: template.into(),
            options: OptionSet::default(),
            warnings: Vec::new(),
            download_url: None,
        }
    }
}

/// Epoch milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(crate::util::now_millis())
    }

    pub fn millis(self) -> i64 {
        self.0
    }

    /// Parse an RFC 3339 string, or a zone-less ISO-8601 string taken as UTC.
    pub fn parse_iso(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Ok(dt) = OffsetDateTime::parse(s, &Rfc3339) {
            return Some(Self::from_datetime(dt));
        }
        let with_fraction =
            format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");
        let plain = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
        PrimitiveDateTime::parse(s, &with_fraction)
            .or_else(|_| PrimitiveDateTime::parse(s, &plain))
            .ok()
            .map(|dt| Self::from_datetime(dt.assume_utc()))
    }

    fn from_datetime(dt: OffsetDateTime) -> Self {
        Timestamp((dt.unix_timestamp_nanos() / 1_000_000) as i64)
    }

    pub fn to_rfc3339(self) -> String {
        OffsetDateTime::from_unix_timestamp_nanos(self.0 as i128 * 1_000_000)
            .ok()
            .and_then(|dt| dt.format(&Rfc3339).ok())
            .unwrap_or_else(|| self.0.to_string())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Float(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(ms) => Ok(Timestamp(ms)),
            Raw::Float(ms) => Ok(Timestamp(ms as i64)),
            Raw::Text(s) => {
                if let Ok(ms) = s.trim().parse::<i64>() {
                    return Ok(Timestamp(ms));
                }
                Timestamp::parse_iso(&s)
                    .ok_or_else(|| de::Error::custom(format!("unrecognized timestamp: {s}")))
            }
        }
    }
}

/// Enabled transformation flags. A set: duplicates collapse and order does not matter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OptionSet(BTreeSet<String>);

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>) -> bool {
        let key = key.into();
        let key = key.trim();
        if key.is_empty() {
            return false;
        }
        self.0.insert(key.to_string())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Wire form used by the formatting service's `options` form field.
    pub fn to_csv(&self) -> String {
        self.iter().collect::<Vec<_>>().join(",")
    }
}

impl<S: Into<String>> FromIterator<S> for OptionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = OptionSet::new();
        for key in iter {
            set.insert(key);
        }
        set
    }
}

impl<'de> Deserialize<'de> for OptionSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<OneOrMany>::deserialize(deserializer)? {
            None => Ok(OptionSet::new()),
            Some(OneOrMany::Many(keys)) => Ok(keys.into_iter().collect()),
            Some(OneOrMany::One(csv)) => Ok(csv.split(',').collect()),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn de_warnings<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(w)) if w.trim().is_empty() => Vec::new(),
        Some(OneOrMany::One(w)) => vec![w],
        Some(OneOrMany::Many(ws)) => ws,
    })
}

/// Normalize a service `warnings` value (absent, one string, or a list).
pub fn normalize_warnings(value: Option<serde_json::Value>) -> Vec<String> {
    match value {
        Some(serde_json::Value::String(w)) if !w.trim().is_empty() => vec![w],
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn de_job_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Int(i64),
    }

    let id = match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s.trim().to_string(),
        RawId::Int(n) => n.to_string(),
    };
    if id.is_empty() {
        return Err(de::Error::custom("job id is empty"));
    }
    Ok(id)
}
