//! The narrow transport interface the poller consumes.
//!
//! A transport turns an href into a sequence of [`Record`]s. Records are
//! tree-shaped JSON documents read through dotted paths; a `#` path segment
//! maps the rest of the path over an array (`aggregates.#.name`).

use ahash::AHashMap as HashMap;
use serde_json::Value;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no records for [{0}]")]
    NotFound(String),

    /// The transfer stopped early; `records` holds what did arrive.
    #[error("transfer truncated after {} records: {reason}", records.len())]
    Truncated { records: Vec<Record>, reason: String },

    #[error("failed to decode records: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Source of records for one href.
pub trait Transport {
    fn fetch(&mut self, href: &str) -> Result<Vec<Record>, TransportError>;
}

/// One record of a fetch result.
#[derive(Debug, Clone, PartialEq)]
pub struct Record(Value);

impl Record {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Looks up a dotted path.
    pub fn get(&self, path: &str) -> RecordValue {
        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        RecordValue(lookup(&self.0, &segments))
    }
}

impl From<Value> for Record {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

fn lookup(value: &Value, segments: &[&str]) -> Option<Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(value.clone());
    };
    if *head == "#" {
        let items = value.as_array()?;
        let mapped: Vec<Value> = items.iter().filter_map(|v| lookup(v, rest)).collect();
        return Some(Value::Array(mapped));
    }
    match value {
        Value::Object(map) => map.get(*head).and_then(|v| lookup(v, rest)),
        Value::Array(items) => {
            let idx: usize = head.parse().ok()?;
            items.get(idx).and_then(|v| lookup(v, rest))
        }
        _ => None,
    }
}

/// Result of a path lookup. Readers never fail; a missing value reads as the
/// zero value of the requested kind.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordValue(Option<Value>);

impl RecordValue {
    pub fn exists(&self) -> bool {
        matches!(&self.0, Some(v) if !v.is_null())
    }

    pub fn raw(&self) -> Option<&Value> {
        self.0.as_ref()
    }

    pub fn string(&self) -> String {
        match &self.0 {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(Value::Bool(b)) => b.to_string(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => other.to_string(),
        }
    }

    pub fn int(&self) -> i64 {
        match &self.0 {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            Some(Value::Bool(b)) => i64::from(*b),
            _ => 0,
        }
    }

    pub fn float(&self) -> f64 {
        match &self.0 {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
            Some(Value::Bool(b)) => f64::from(u8::from(*b)),
            _ => 0.0,
        }
    }

    pub fn bool(&self) -> bool {
        match &self.0 {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            _ => false,
        }
    }

    pub fn array(&self) -> Vec<RecordValue> {
        match &self.0 {
            Some(Value::Array(items)) => items.iter().cloned().map(|v| RecordValue(Some(v))).collect(),
            _ => Vec::new(),
        }
    }
}

/// Builds REST query hrefs.
#[derive(Debug, Clone, Default)]
pub struct HrefBuilder {
    api_path: String,
    fields: Vec<String>,
    filter: Vec<String>,
    max_records: Option<usize>,
    return_timeout: Option<u32>,
}

impl HrefBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn api_path(mut self, path: impl Into<String>) -> Self {
        self.api_path = path.into();
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter<I, S>(mut self, filter: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter = filter.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_records(mut self, n: usize) -> Self {
        self.max_records = Some(n);
        self
    }

    pub fn return_timeout(mut self, seconds: u32) -> Self {
        self.return_timeout = Some(seconds);
        self
    }

    pub fn build(&self) -> String {
        let mut href = format!("{}?return_records=true", self.api_path);
        if !self.fields.is_empty() {
            href.push_str("&fields=");
            href.push_str(&self.fields.join(","));
        }
        for f in &self.filter {
            href.push('&');
            href.push_str(f);
        }
        if let Some(n) = self.max_records {
            href.push_str(&format!("&max_records={n}"));
        }
        if let Some(t) = self.return_timeout {
            href.push_str(&format!("&return_timeout={t}"));
        }
        href
    }
}

/// API path part of an href (everything before `?`).
pub fn api_path(href: &str) -> &str {
    href.split_once('?').map(|(p, _)| p).unwrap_or(href)
}

/// Decodes a recording: either `{"records": [...]}` or a bare array.
pub fn parse_records(content: &str) -> Result<Vec<Record>, TransportError> {
    let value: Value =
        serde_json::from_str(content).map_err(|e| TransportError::Decode(e.to_string()))?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("records") {
            Some(Value::Array(items)) => items,
            _ => return Err(TransportError::Decode("missing records array".into())),
        },
        _ => return Err(TransportError::Decode("expected an object or array".into())),
    };
    Ok(items.into_iter().map(Record::new).collect())
}

pub fn load_records(path: &Path) -> Result<Vec<Record>, TransportError> {
    let content = fs::read_to_string(path)?;
    parse_records(&content)
}

enum Recorded {
    Complete(Vec<Record>),
    Truncated(Vec<Record>, String),
}

/// Serves recorded record sets keyed by API path.
#[derive(Default)]
pub struct ReplayTransport {
    recordings: HashMap<String, Recorded>,
    requests: Vec<String>,
}

impl ReplayTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, records: Vec<Record>) {
        self.recordings
            .insert(path.into(), Recorded::Complete(records));
    }

    /// Serves `records` followed by a truncation error.
    pub fn insert_truncated(&mut self, path: impl Into<String>, records: Vec<Record>, reason: impl Into<String>) {
        self.recordings
            .insert(path.into(), Recorded::Truncated(records, reason.into()));
    }

    /// Every href fetched so far, in order.
    pub fn requests(&self) -> &[String] {
        &self.requests
    }
}

impl Transport for ReplayTransport {
    fn fetch(&mut self, href: &str) -> Result<Vec<Record>, TransportError> {
        self.requests.push(href.to_string());
        let path = api_path(href);
        debug!(href, "replay fetch");
        match self.recordings.get(path) {
            Some(Recorded::Complete(records)) => Ok(records.clone()),
            Some(Recorded::Truncated(records, reason)) => Err(TransportError::Truncated {
                records: records.clone(),
                reason: reason.clone(),
            }),
            None => Err(TransportError::NotFound(href.to_string())),
        }
    }
}
