//! Date-aware serialization for cached values.
//!
//! Plain JSON has no date type: a timestamp written as a string comes back as
//! a string. Every date/time leaf is therefore written as a tagged wrapper,
//!
//! ```json
//! { "__type": "Date", "value": "2026-03-14T09:30:00Z" }
//! ```
//!
//! and turned back into a date/time on read. Dynamic values go through
//! [`CacheValue`]; typed structs opt in per field with
//! `#[serde(with = "molar_cache::codec::tagged_datetime")]`.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::CodecError;

pub const TYPE_MARKER_KEY: &str = "__type";
pub const DATE_MARKER: &str = "Date";

/// Dynamic cached value with first-class date/time leaves.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    DateTime(OffsetDateTime),
    Array(Vec<CacheValue>),
    Object(BTreeMap<String, CacheValue>),
}

/// Converts a value to its wire form, tagging every date/time leaf.
pub fn serialize(value: &CacheValue) -> Value {
    match value {
        CacheValue::Null => Value::Null,
        CacheValue::Bool(b) => Value::Bool(*b),
        CacheValue::Number(n) => Value::Number(n.clone()),
        CacheValue::String(s) => Value::String(s.clone()),
        CacheValue::DateTime(dt) => tagged_date(*dt),
        CacheValue::Array(items) => Value::Array(items.iter().map(serialize).collect()),
        CacheValue::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), serialize(v)))
                .collect::<Map<_, _>>(),
        ),
    }
}

/// Inverse of [`serialize`]: restores tagged date/time wrappers.
///
/// A wrapper whose `value` is not a valid RFC 3339 timestamp is kept as a
/// plain object.
pub fn deserialize(wire: Value) -> CacheValue {
    match wire {
        Value::Null => CacheValue::Null,
        Value::Bool(b) => CacheValue::Bool(b),
        Value::Number(n) => CacheValue::Number(n),
        Value::String(s) => CacheValue::String(s),
        Value::Array(items) => CacheValue::Array(items.into_iter().map(deserialize).collect()),
        Value::Object(fields) => match parse_tagged_date(&fields) {
            Some(dt) => CacheValue::DateTime(dt),
            None => CacheValue::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, deserialize(v)))
                    .collect(),
            ),
        },
    }
}

fn tagged_date(dt: OffsetDateTime) -> Value {
    let mut wrapper = Map::with_capacity(2);
    wrapper.insert(TYPE_MARKER_KEY.into(), Value::String(DATE_MARKER.into()));
    wrapper.insert("value".into(), Value::String(format_iso(dt)));
    Value::Object(wrapper)
}

fn parse_tagged_date(fields: &Map<String, Value>) -> Option<OffsetDateTime> {
    if fields.len() != 2 {
        return None;
    }
    match (fields.get(TYPE_MARKER_KEY), fields.get("value")) {
        (Some(Value::String(marker)), Some(Value::String(iso))) if marker == DATE_MARKER => {
            OffsetDateTime::parse(iso, &Rfc3339).ok()
        }
        _ => None,
    }
}

/// RFC 3339 rendering; falls back to UTC for offsets RFC 3339 cannot express.
fn format_iso(dt: OffsetDateTime) -> String {
    dt.format(&Rfc3339)
        .or_else(|_| dt.to_offset(time::UtcOffset::UTC).format(&Rfc3339))
        .unwrap_or_else(|_| dt.unix_timestamp().to_string())
}

impl Serialize for CacheValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CacheValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(deserialize)
    }
}

impl From<OffsetDateTime> for CacheValue {
    fn from(dt: OffsetDateTime) -> Self {
        CacheValue::DateTime(dt)
    }
}

impl From<&str> for CacheValue {
    fn from(s: &str) -> Self {
        CacheValue::String(s.to_string())
    }
}

impl From<String> for CacheValue {
    fn from(s: String) -> Self {
        CacheValue::String(s)
    }
}

impl From<bool> for CacheValue {
    fn from(b: bool) -> Self {
        CacheValue::Bool(b)
    }
}

impl From<i64> for CacheValue {
    fn from(n: i64) -> Self {
        CacheValue::Number(n.into())
    }
}

impl From<Vec<CacheValue>> for CacheValue {
    fn from(items: Vec<CacheValue>) -> Self {
        CacheValue::Array(items)
    }
}

impl FromIterator<(String, CacheValue)> for CacheValue {
    fn from_iter<I: IntoIterator<Item = (String, CacheValue)>>(iter: I) -> Self {
        CacheValue::Object(iter.into_iter().collect())
    }
}

/// Serializes any value into the cached payload.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String, CodecError> {
    Ok(serde_json::to_string(value)?)
}

/// Parses a cached payload back into `T`.
pub fn decode<T: DeserializeOwned>(payload: &str) -> Result<T, CodecError> {
    Ok(serde_json::from_str(payload)?)
}

/// Serde helpers writing `OffsetDateTime` fields as tagged date wrappers.
///
/// Reading also accepts a bare RFC 3339 string, so fields can be migrated to
/// the tagged form without invalidating existing entries.
pub mod tagged_datetime {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use time::OffsetDateTime;
    use time::format_description::well_known::Rfc3339;

    use super::{DATE_MARKER, format_iso};

    #[derive(Serialize)]
    struct TaggedOut<'a> {
        #[serde(rename = "__type")]
        marker: &'a str,
        value: String,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TaggedIn {
        Tagged {
            #[serde(rename = "__type")]
            marker: String,
            value: String,
        },
        Plain(String),
    }

    pub fn serialize<S: Serializer>(dt: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        TaggedOut {
            marker: DATE_MARKER,
            value: format_iso(*dt),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OffsetDateTime, D::Error> {
        let iso = match TaggedIn::deserialize(deserializer)? {
            TaggedIn::Tagged { marker, value } if marker == DATE_MARKER => value,
            TaggedIn::Tagged { marker, .. } => {
                return Err(D::Error::custom(format!("unexpected type marker `{marker}`")));
            }
            TaggedIn::Plain(value) => value,
        };
        OffsetDateTime::parse(&iso, &Rfc3339).map_err(D::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::OffsetDateTime;

        #[derive(Deserialize)]
        struct Wrapped(#[serde(with = "super")] OffsetDateTime);

        pub fn serialize<S: Serializer>(
            dt: &Option<OffsetDateTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match dt {
                Some(dt) => super::serialize(dt, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<OffsetDateTime>, D::Error> {
            Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(dt)| dt))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Appointment {
        id: String,
        #[serde(with = "tagged_datetime")]
        starts_at: OffsetDateTime,
        #[serde(default, with = "tagged_datetime::option")]
        cancelled_at: Option<OffsetDateTime>,
    }

    fn sample() -> CacheValue {
        let visit: CacheValue = [
            ("at".to_string(), datetime!(2026-03-14 09:30:00.125 UTC).into()),
            ("chair".to_string(), 3i64.into()),
        ]
        .into_iter()
        .collect();

        [
            ("patient".to_string(), "Ana".into()),
            ("active".to_string(), true.into()),
            ("balance".to_string(), CacheValue::Number(Number::from_f64(12.5).unwrap())),
            ("note".to_string(), CacheValue::Null),
            (
                "born".to_string(),
                datetime!(1990-01-02 00:00:00 +02:00).into(),
            ),
            ("visits".to_string(), vec![visit, CacheValue::Null].into()),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_round_trip_nested_dates() {
        let value = sample();
        let wire = serialize(&value);
        assert_eq!(deserialize(wire), value);
    }

    #[test]
    fn test_round_trip_through_payload() {
        let value = sample();
        let payload = encode(&value).unwrap();
        let back: CacheValue = decode(&payload).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_date_leaf_wire_shape() {
        let wire = serialize(&CacheValue::DateTime(datetime!(2026-03-14 09:30:00 UTC)));
        assert_eq!(
            wire,
            json!({ "__type": "Date", "value": "2026-03-14T09:30:00Z" })
        );
    }

    #[test]
    fn test_iso_strings_stay_strings() {
        let value = deserialize(json!({ "created": "2026-03-14T09:30:00Z" }));
        match value {
            CacheValue::Object(fields) => assert_eq!(
                fields["created"],
                CacheValue::String("2026-03-14T09:30:00Z".into())
            ),
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_wrapper_kept_as_object() {
        let wire = json!({ "__type": "Date", "value": "not a date" });
        assert!(matches!(deserialize(wire), CacheValue::Object(_)));

        let extra = json!({ "__type": "Date", "value": "2026-03-14T09:30:00Z", "x": 1 });
        assert!(matches!(deserialize(extra), CacheValue::Object(_)));
    }

    #[test]
    fn test_typed_struct_fields() {
        let appt = Appointment {
            id: "apt_1".into(),
            starts_at: datetime!(2026-05-01 14:00:00 UTC),
            cancelled_at: None,
        };
        let payload = encode(&appt).unwrap();
        let wire: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(wire["starts_at"]["__type"], "Date");

        let back: Appointment = decode(&payload).unwrap();
        assert_eq!(back, appt);

        let cancelled = Appointment {
            cancelled_at: Some(datetime!(2026-04-30 08:00:00 UTC)),
            ..appt
        };
        let back: Appointment = decode(&encode(&cancelled).unwrap()).unwrap();
        assert_eq!(back, cancelled);
    }

    #[test]
    fn test_typed_field_accepts_plain_string() {
        let back: Appointment =
            decode(r#"{"id":"apt_2","starts_at":"2026-05-01T14:00:00Z"}"#).unwrap();
        assert_eq!(back.starts_at, datetime!(2026-05-01 14:00:00 UTC));
        assert_eq!(back.cancelled_at, None);
    }
}
