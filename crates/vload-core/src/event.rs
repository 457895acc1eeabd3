//! Object-created event parsing and prefix derivation.

use crate::error::EventError;
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use tracing::{debug, warn};

const SUPPORTED_SOURCE: &str = "aws:s3";
const SUPPORTED_SCHEMA_VERSION: &str = "1.0";
const SUPPORTED_EVENT_NAMES: [&str; 3] = [
    "ObjectCreated:Put",
    "ObjectCreated:Copy",
    "ObjectCreated:CompleteMultipartUpload",
];

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(rename = "Records")]
    records: Option<Vec<EventRecord>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventRecord {
    #[serde(default)]
    event_source: String,
    #[serde(default)]
    event_name: String,
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct S3Entity {
    #[serde(default)]
    s3_schema_version: String,
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Debug, Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct S3Object {
    key: String,
}

/// A newly created object, resolved to the prefix it is configured under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectCreated {
    pub bucket: String,
    /// Decoded key, without a leading bucket name
    pub key: String,
    /// Last path component of the key
    pub filename: String,
    /// Configuration lookup key
    pub prefix: String,
}

impl ObjectCreated {
    /// Build from a bucket and an already-decoded key.
    pub fn new(bucket: &str, key: &str) -> Self {
        let bucket_prefix = format!("{bucket}/");
        let key = key.strip_prefix(&bucket_prefix).unwrap_or(key).to_string();
        let filename = key.rsplit('/').next().unwrap_or_default().to_string();
        let prefix = derive_prefix(bucket, &key);
        Self {
            bucket: bucket.to_string(),
            key,
            filename,
            prefix,
        }
    }

    /// Entry reference and processed-file identity, `bucket/key`.
    pub fn item(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }
}

/// What a delivery turned out to contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEvent {
    Object(ObjectCreated),
    /// Payload carries no `Records`; not something this service handles
    Unsupported,
}

/// Parse a raw delivery.
pub fn parse_event_bytes(payload: &[u8]) -> Result<ParsedEvent, EventError> {
    let envelope: EventEnvelope =
        serde_json::from_slice(payload).map_err(|e| EventError::Malformed(e.to_string()))?;
    parse_envelope(envelope)
}

/// Parse a delivery that has already been decoded as JSON.
pub fn parse_event(payload: serde_json::Value) -> Result<ParsedEvent, EventError> {
    let envelope: EventEnvelope =
        serde_json::from_value(payload).map_err(|e| EventError::Malformed(e.to_string()))?;
    parse_envelope(envelope)
}

fn parse_envelope(envelope: EventEnvelope) -> Result<ParsedEvent, EventError> {
    let Some(mut records) = envelope.records else {
        warn!("Event type unsupported, no Records in payload");
        return Ok(ParsedEvent::Unsupported);
    };

    if records.len() > 1 {
        return Err(EventError::MultiRecord(records.len()));
    }
    let Some(record) = records.pop() else {
        warn!("Event carries an empty Records list");
        return Ok(ParsedEvent::Unsupported);
    };

    validate_record(&record)?;

    let key = urlencoding::decode(&record.s3.object.key)
        .map_err(|e| EventError::Malformed(format!("object key is not valid UTF-8: {e}")))?;
    let object = ObjectCreated::new(&record.s3.bucket.name, &key);
    debug!(bucket = %object.bucket, key = %object.key, prefix = %object.prefix, "Parsed object event");
    Ok(ParsedEvent::Object(object))
}

fn validate_record(record: &EventRecord) -> Result<(), EventError> {
    if record.event_source != SUPPORTED_SOURCE {
        return Err(EventError::Rejected(format!(
            "Invalid Event Source {}",
            record.event_source
        )));
    }
    if !SUPPORTED_EVENT_NAMES.contains(&record.event_name.as_str()) {
        return Err(EventError::Rejected(format!(
            "Invalid Event Name {}",
            record.event_name
        )));
    }
    if record.s3.s3_schema_version != SUPPORTED_SCHEMA_VERSION {
        return Err(EventError::Rejected(format!(
            "Unknown S3 Schema Version {}",
            record.s3.s3_schema_version
        )));
    }
    Ok(())
}

/// Configuration lookup key for an object: `bucket` for keys at the bucket
/// root, otherwise `bucket/<directory>` with numeric Hive partition values
/// wildcarded (`date=20240101` → `date=*`).
pub fn derive_prefix(bucket: &str, key: &str) -> String {
    let directory = match key.rfind('/') {
        Some(idx) => key[..idx].trim_end_matches('/'),
        None => "",
    };
    if directory.is_empty() {
        bucket.to_string()
    } else {
        format!("{bucket}/{}", wildcard_partitions(directory))
    }
}

/// Runs of `=<digits>` partition values.
static PARTITION_VALUES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(=\d+)+").expect("valid partition pattern"));

/// Replace every run of `=<digits>` groups with a single `=*`.
fn wildcard_partitions(path: &str) -> String {
    PARTITION_VALUES.replace_all(path, "=*").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(source: &str, name: &str, version: &str, key: &str) -> serde_json::Value {
        json!({
            "eventSource": source,
            "eventName": name,
            "s3": {
                "s3SchemaVersion": version,
                "bucket": { "name": "bucket" },
                "object": { "key": key }
            }
        })
    }

    fn expect_object(parsed: ParsedEvent) -> ObjectCreated {
        match parsed {
            ParsedEvent::Object(o) => o,
            other => panic!("expected object event, got {other:?}"),
        }
    }

    #[test]
    fn test_put_event_parses() {
        let payload = json!({
            "Records": [record("aws:s3", "ObjectCreated:Put", "1.0", "input/a.csv")]
        });
        let object = expect_object(parse_event(payload).unwrap());
        assert_eq!(object.bucket, "bucket");
        assert_eq!(object.key, "input/a.csv");
        assert_eq!(object.filename, "a.csv");
        assert_eq!(object.prefix, "bucket/input");
        assert_eq!(object.item(), "bucket/input/a.csv");
    }

    #[test]
    fn test_missing_records_is_unsupported() {
        let parsed = parse_event(json!({ "detail-type": "Scheduled Event" })).unwrap();
        assert_eq!(parsed, ParsedEvent::Unsupported);
    }

    #[test]
    fn test_multi_record_rejected() {
        let r = record("aws:s3", "ObjectCreated:Put", "1.0", "input/a.csv");
        let payload = json!({ "Records": [r.clone(), r] });
        assert!(matches!(
            parse_event(payload),
            Err(EventError::MultiRecord(2))
        ));
    }

    #[test]
    fn test_unsupported_source_name_and_version_rejected() {
        let cases = [
            record("aws:sqs", "ObjectCreated:Put", "1.0", "a.csv"),
            record("aws:s3", "ObjectRemoved:Delete", "1.0", "a.csv"),
            record("aws:s3", "ObjectCreated:Put", "2.0", "a.csv"),
        ];
        for case in cases {
            let result = parse_event(json!({ "Records": [case] }));
            assert!(matches!(result, Err(EventError::Rejected(_))));
        }
    }

    #[test]
    fn test_all_object_created_names_accepted() {
        for name in SUPPORTED_EVENT_NAMES {
            let payload = json!({ "Records": [record("aws:s3", name, "1.0", "x/y.csv")] });
            assert!(parse_event(payload).is_ok());
        }
    }

    #[test]
    fn test_key_is_percent_decoded_and_bucket_stripped() {
        let payload = json!({
            "Records": [record("aws:s3", "ObjectCreated:Copy", "1.0", "bucket/in%20put/a%2Bb.csv")]
        });
        let object = expect_object(parse_event(payload).unwrap());
        assert_eq!(object.key, "in put/a+b.csv");
        assert_eq!(object.prefix, "bucket/in put");
    }

    #[test]
    fn test_malformed_payload() {
        assert!(matches!(
            parse_event_bytes(b"not json"),
            Err(EventError::Malformed(_))
        ));
    }

    #[test]
    fn test_prefix_at_bucket_root() {
        assert_eq!(derive_prefix("bucket", "a.csv"), "bucket");
    }

    #[test]
    fn test_prefix_wildcards_hive_partitions() {
        assert_eq!(
            derive_prefix("bucket", "data/year=2024/month=01/f.csv"),
            "bucket/data/year=*/month=*"
        );
        assert_eq!(derive_prefix("bucket", "data/k=1=2/f.csv"), "bucket/data/k=*");
        assert_eq!(derive_prefix("bucket", "data/region=eu/f.csv"), "bucket/data/region=eu");
    }
}
