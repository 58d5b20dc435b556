//! InfluxDB v2 wire helpers shared by the device and host HTTP clients.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use url::Url;

use crate::{error::DbError, types::DbEndpoint};

pub const TAG_DEVICE: &str = "device";
pub const TAG_NETWORK: &str = "SSID";
pub const FIELD_RSSI: &str = "rssi";
pub const FIELD_TEMPERATURE: &str = "temperature";

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
}

/// One tagged, optionally timestamped record.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryPoint {
    measurement: String,
    tags: Vec<(String, String)>,
    fields: Vec<(String, FieldValue)>,
    timestamp: Option<DateTime<Utc>>,
}

impl TelemetryPoint {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp: None,
        }
    }

    pub fn add_tag(&mut self, key: &str, value: &str) -> &mut Self {
        if !value.is_empty() {
            self.tags.push((key.to_string(), value.to_string()));
        }
        self
    }

    pub fn add_field(&mut self, key: &str, value: FieldValue) -> &mut Self {
        self.fields.push((key.to_string(), value));
        self
    }

    pub fn set_timestamp(&mut self, timestamp: Option<DateTime<Utc>>) -> &mut Self {
        self.timestamp = timestamp;
        self
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    /// Line protocol with second precision.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);
        for (key, value) in &self.tags {
            let _ = write!(
                line,
                ",{}={}",
                escape(key, &[',', '=', ' ']),
                escape(value, &[',', '=', ' '])
            );
        }

        for (index, (key, value)) in self.fields.iter().enumerate() {
            line.push(if index == 0 { ' ' } else { ',' });
            line.push_str(&escape(key, &[',', '=', ' ']));
            line.push('=');
            match value {
                FieldValue::Float(value) => {
                    let _ = write!(line, "{value}");
                }
                FieldValue::Integer(value) => {
                    let _ = write!(line, "{value}i");
                }
            }
        }

        if let Some(timestamp) = self.timestamp {
            let _ = write!(line, " {}", timestamp.timestamp());
        }
        line
    }
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch == '\\' || special.contains(&ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn api_url(endpoint: &DbEndpoint, path: &str) -> Result<Url, DbError> {
    let mut base = Url::parse(endpoint.url.trim())
        .map_err(|err| DbError::InvalidParameters(format!("url `{}`: {err}", endpoint.url)))?;

    if !matches!(base.scheme(), "http" | "https") {
        return Err(DbError::InvalidParameters(format!(
            "url `{}` must use http or https",
            endpoint.url
        )));
    }
    if base.host_str().is_none() {
        return Err(DbError::InvalidParameters(format!(
            "url `{}` has no host",
            endpoint.url
        )));
    }

    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.set_query(None);

    base.join(path)
        .map_err(|err| DbError::InvalidParameters(format!("url `{}`: {err}", endpoint.url)))
}

pub fn write_url(endpoint: &DbEndpoint) -> Result<Url, DbError> {
    let mut url = api_url(endpoint, "api/v2/write")?;
    url.query_pairs_mut()
        .append_pair("org", &endpoint.organization)
        .append_pair("bucket", &endpoint.bucket)
        .append_pair("precision", "s");
    Ok(url)
}

pub fn buckets_url(endpoint: &DbEndpoint) -> Result<Url, DbError> {
    let mut url = api_url(endpoint, "api/v2/buckets")?;
    url.query_pairs_mut()
        .append_pair("org", &endpoint.organization)
        .append_pair("name", &endpoint.bucket);
    Ok(url)
}

pub fn authorization(endpoint: &DbEndpoint) -> String {
    format!("Token {}", endpoint.token)
}

#[derive(Debug, Deserialize)]
struct BucketList {
    #[serde(default)]
    buckets: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

fn server_message(body: &str) -> String {
    serde_json::from_str::<ApiError>(body)
        .map(|err| err.message)
        .ok()
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| body.trim().chars().take(200).collect())
}

/// Interprets the bucket lookup made to validate an endpoint.
pub fn check_validation_response(
    endpoint: &DbEndpoint,
    status: u16,
    body: &str,
) -> Result<(), DbError> {
    match status {
        200..=299 => {
            let list: BucketList = serde_json::from_str(body).map_err(|err| DbError::Rejected {
                status,
                message: format!("unreadable bucket list: {err}"),
            })?;
            if list.buckets.is_empty() {
                Err(DbError::InvalidParameters(format!(
                    "bucket `{}` not found in organisation `{}`",
                    endpoint.bucket, endpoint.organization
                )))
            } else {
                Ok(())
            }
        }
        400 | 401 | 403 | 404 => Err(DbError::InvalidParameters(format!(
            "HTTP {status}: {}",
            server_message(body)
        ))),
        _ => Err(DbError::Rejected {
            status,
            message: server_message(body),
        }),
    }
}

pub fn check_write_response(status: u16, body: &str) -> Result<(), DbError> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(DbError::Rejected {
            status,
            message: server_message(body),
        })
    }
}
