//! The `MetricSample` wire-and-storage type, and the compact tag encoding
//! used on disk and in the agent→aggregator envelope.

use std::collections::BTreeMap;
use std::fmt;

/// A small string→string mapping attached to a sample (e.g. `{core: "3"}`,
/// `{iface: "eth0"}`). `BTreeMap` keeps serialization order stable, which
/// matters because the compact encoding is part of the sample's identity.
pub type Tags = BTreeMap<String, String>;

/// Encodes tags into the compact textual form used for storage and the
/// wire envelope: `"k1=v1,k2=v2"`, keys in sorted order. Empty tags encode
/// to the empty string.
pub fn encode_tags(tags: &Tags) -> String {
    tags.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Decodes the compact textual tag form back into a `Tags` map. Absent and
/// empty input both decode to an empty map ("empty tags vs
/// absent tags: treated identically on read".
pub fn decode_tags(encoded: &str) -> Tags {
    let mut tags = Tags::new();
    if encoded.is_empty() {
        return tags;
    }
    for pair in encoded.split(',') {
        if let Some((k, v)) = pair.split_once('=') {
            tags.insert(k.to_owned(), v.to_owned());
        }
    }
    tags
}

/// One `(timestamp, metric_type, host, tags, value)` tuple.
///
/// `(timestamp, metric_type, host, tags)` is the primary key: no two
/// samples with an identical key coexist in a `TimeSeriesStore`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MetricSample {
    /// Seconds since epoch.
    pub timestamp: i64,
    /// Dotted ASCII name, e.g. `cpu.total_usage`, limited to 128 chars by
    /// convention; callers are responsible for not exceeding it.
    pub metric_type: String,
    /// Hostname this sample was produced on, stable per agent lifetime.
    pub host: String,
    /// Small string→string mapping, e.g. `{core: "3"}`.
    #[serde(default)]
    pub tags: Tags,
    pub value: f64,
}

impl MetricSample {
    pub fn new(
        timestamp: i64,
        metric_type: impl Into<String>,
        host: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            timestamp,
            metric_type: metric_type.into(),
            host: host.into(),
            tags: Tags::new(),
            value,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn tags_encoded(&self) -> String {
        encode_tags(&self.tags)
    }
}

impl fmt::Display for MetricSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} {}={} [{}]",
            self.host,
            self.timestamp,
            self.metric_type,
            self.value,
            self.tags_encoded()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trip() {
        let mut tags = Tags::new();
        tags.insert("core".to_owned(), "3".to_owned());
        tags.insert("iface".to_owned(), "eth0".to_owned());
        let encoded = encode_tags(&tags);
        assert_eq!(encoded, "core=3,iface=eth0");
        assert_eq!(decode_tags(&encoded), tags);
    }

    #[test]
    fn empty_and_absent_tags_are_identical() {
        assert_eq!(decode_tags(""), Tags::new());
        assert_eq!(encode_tags(&Tags::new()), "");
    }
}
