use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "opaque_id::deserialize"
    )]
    pub id: Option<String>,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    #[serde(with = "timestamp")]
    pub time_sent: DateTime<Utc>,
}

impl Message {
    /// A message authored locally, not yet known to the backend.
    pub fn local(sender_id: &str, recipient_id: &str, content: &str, time_sent: DateTime<Utc>) -> Self {
        Self {
            id: None,
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.to_string(),
            content: content.to_string(),
            time_sent,
        }
    }

    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender_id == user_id
    }

    /// Identity used to match an id-less local copy against its persisted form.
    pub fn fingerprint(&self) -> (&str, &str, &str, i64) {
        (
            &self.sender_id,
            &self.recipient_id,
            &self.content,
            self.time_sent.timestamp_millis(),
        )
    }
}

/// ISO-8601 timestamps as exchanged with the backend.
///
/// The backend is not consistent about offsets, so values without one are read as UTC.
/// Output always matches what a browser's `toISOString()` produces.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(value: &DateTime<Utc>) -> String {
        value.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
    }
}

mod opaque_id {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(serde_json::Number),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        Ok(Option::<RawId>::deserialize(deserializer)?.map(|raw| match raw {
            RawId::Text(text) => text,
            RawId::Number(number) => number.to_string(),
        }))
    }
}
