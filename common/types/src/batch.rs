use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single telemetry data point, as sent by client SDKs.
///
/// Field names on the wire are kept short to save bandwidth on mobile clients,
/// the Rust names spell them out.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TelemetryRecord {
    /// Client-side capture time, in milliseconds since epoch.
    #[serde(rename = "tsclient")]
    pub client_timestamp: i64,
    /// Server-side receipt time, in milliseconds since epoch. Older SDKs don't send it.
    #[serde(rename = "tsserver", default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<i64>,
    #[serde(rename = "sessid")]
    pub session_id: String,
    pub value: String,
    pub label: String,
}

/// The records submitted by one ingestion request, in submission order.
///
/// A batch travels through the broker as a single message: its canonical
/// form is the compact JSON array of its records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct EventBatch {
    records: Vec<TelemetryRecord>,
}

impl EventBatch {
    pub fn new(records: Vec<TelemetryRecord>) -> Self {
        Self { records }
    }

    /// Decode a batch from a JSON array. Anything else (objects, nulls,
    /// records missing required fields) is rejected.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Encode to the canonical byte form published to the broker.
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[TelemetryRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TelemetryRecord> {
        self.records.iter()
    }

    /// Fill in the server timestamp of every record that doesn't carry one.
    pub fn stamp_server_time(&mut self, now_millis: i64) {
        for record in self.records.iter_mut() {
            record.server_timestamp.get_or_insert(now_millis);
        }
    }

    pub fn into_records(self) -> Vec<TelemetryRecord> {
        self.records
    }
}

impl<'a> IntoIterator for &'a EventBatch {
    type Item = &'a TelemetryRecord;
    type IntoIter = std::slice::Iter<'a, TelemetryRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_records_in_order() {
        let body = br#"[
            {"tsclient": 100, "sessid": "s1", "value": "v1", "label": "click"},
            {"tsclient": 200, "tsserver": 210, "sessid": "s1", "value": "v2", "label": "scroll"}
        ]"#;

        let batch = EventBatch::from_slice(body).expect("valid batch");

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records()[0].client_timestamp, 100);
        assert_eq!(batch.records()[0].server_timestamp, None);
        assert_eq!(batch.records()[1].server_timestamp, Some(210));
        assert_eq!(batch.records()[1].label, "scroll");
    }

    #[test]
    fn empty_array_is_a_valid_batch() {
        let batch = EventBatch::from_slice(b"[]").expect("valid batch");
        assert!(batch.is_empty());
        assert_eq!(batch.to_bytes().unwrap(), Bytes::from_static(b"[]"));
    }

    #[test]
    fn rejects_wrong_shapes() {
        for body in [
            &b"not-json"[..],
            b"null",
            b"{}",
            br#"{"tsclient": 1, "sessid": "s", "value": "v", "label": "l"}"#,
            br#"[{"sessid": "s", "value": "v", "label": "l"}]"#,
            br#"[{"tsclient": "yesterday", "sessid": "s", "value": "v", "label": "l"}]"#,
            br#"[1, 2, 3]"#,
        ] {
            assert!(
                EventBatch::from_slice(body).is_err(),
                "accepted {}",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn canonical_encoding_uses_wire_names_and_drops_unknown_fields() {
        let body =
            br#"[{"tsclient":100,"sessid":"s1","value":"v","label":"click","extra":{"a":1}}]"#;
        let batch = EventBatch::from_slice(body).unwrap();

        let encoded = batch.to_bytes().unwrap();
        assert_eq!(
            encoded,
            Bytes::from_static(br#"[{"tsclient":100,"sessid":"s1","value":"v","label":"click"}]"#)
        );
        assert_eq!(EventBatch::from_slice(&encoded).unwrap(), batch);
    }

    #[test]
    fn stamping_keeps_client_provided_server_time() {
        let mut batch = EventBatch::new(vec![
            TelemetryRecord {
                client_timestamp: 1,
                server_timestamp: None,
                session_id: "s".to_string(),
                value: "v".to_string(),
                label: "l".to_string(),
            },
            TelemetryRecord {
                client_timestamp: 2,
                server_timestamp: Some(5),
                session_id: "s".to_string(),
                value: "v".to_string(),
                label: "l".to_string(),
            },
        ]);

        batch.stamp_server_time(42);

        let stamped: Vec<Option<i64>> = batch.iter().map(|r| r.server_timestamp).collect();
        assert_eq!(stamped, vec![Some(42), Some(5)]);
    }
}
