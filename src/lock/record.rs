use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Per-holder metadata carried alongside the holder identity
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMeta {
    /// Whether the node was already cordoned when maintenance began
    pub unschedulable: bool,
    /// Absent means the record never expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl NodeMeta {
    pub fn new(unschedulable: bool) -> Self {
        Self {
            unschedulable,
            expires_at: None,
        }
    }
}

/// The value stored in the lock annotation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    #[serde(rename = "holderID")]
    pub holder_id: String,
    #[serde(default)]
    pub metadata: NodeMeta,
}

impl LockRecord {
    pub fn new(holder_id: impl Into<String>, metadata: NodeMeta) -> Self {
        Self {
            holder_id: holder_id.into(),
            metadata,
        }
    }

    /// A record is held only while `now < expiresAt`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match self.metadata.expires_at {
            Some(expires_at) => now < expires_at,
            None => true,
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::CorruptLock(format!("{raw:?}: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_wire_format() {
        let expires = "2019-04-05T17:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let record = LockRecord::new(
            "worker-1",
            NodeMeta {
                unschedulable: true,
                expires_at: Some(expires),
            },
        );
        assert_eq!(
            record.to_json().unwrap(),
            r#"{"holderID":"worker-1","metadata":{"unschedulable":true,"expiresAt":"2019-04-05T17:30:00Z"}}"#
        );
        assert_eq!(LockRecord::parse(&record.to_json().unwrap()).unwrap(), record);
    }

    #[test]
    fn test_validity_is_exclusive_of_expiry() {
        let now = Utc::now();
        let mut record = LockRecord::new("worker-1", NodeMeta::new(false));
        assert!(record.is_valid_at(now));

        record.metadata.expires_at = Some(now);
        assert!(!record.is_valid_at(now));
        assert!(record.is_valid_at(now - Duration::seconds(1)));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        assert!(matches!(
            LockRecord::parse("{not json"),
            Err(Error::CorruptLock(_))
        ));
    }
}
