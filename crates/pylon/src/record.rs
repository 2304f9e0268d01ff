//! Record payload convention consumed by the hook dispatch path.
//!
//! Hooks receive the "new" and "original" versions of a record as JSON
//! objects. Reserved keys start with an underscore (`_id`, `_ownerID`,
//! `_access`, timestamps); everything else is user data. Tagged values
//! (`{"$type": ...}`) are passed through opaquely except `$date`, which has
//! helpers because timestamps are what hooks most often touch.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use crate::error::PluginError;

/// A record identifier, serialized on the wire as `"type/key"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordId {
    pub record_type: String,
    pub key: String,
}

impl RecordId {
    pub fn new(record_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            key: key.into(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, PluginError> {
        match s.split_once('/') {
            Some((record_type, key)) if !record_type.is_empty() => {
                Ok(Self::new(record_type, key))
            }
            _ => Err(PluginError::invalid_argument(format!(
                "malformed record id '{s}'"
            ))),
        }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.record_type, self.key)
    }
}

/// A data record as exchanged with the host.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub owner_id: Option<String>,
    /// ACL entries are carried verbatim; their semantics belong to the host.
    pub acl: Option<Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
    pub data: Map<String, Value>,
}

impl Record {
    pub fn new(id: RecordId) -> Self {
        Self {
            id,
            owner_id: None,
            acl: None,
            created_at: None,
            created_by: None,
            updated_at: None,
            updated_by: None,
            data: Map::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn date_field(obj: &Map<String, Value>, key: &str) -> Result<Option<DateTime<Utc>>, PluginError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => parse_date_str(s).map(Some),
        Some(other) => Err(PluginError::invalid_argument(format!(
            "expected RFC 3339 string for '{key}', got {other}"
        ))),
    }
}

fn parse_date_str(s: &str) -> Result<DateTime<Utc>, PluginError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PluginError::invalid_argument(format!("malformed date '{s}': {e}")))
}

/// Deserialize a record from its wire object form.
pub fn deserialize_record(value: &Value) -> Result<Record, PluginError> {
    let obj = value
        .as_object()
        .ok_or_else(|| PluginError::invalid_argument("record payload must be an object"))?;

    let id_str = obj
        .get("_id")
        .and_then(Value::as_str)
        .ok_or_else(|| PluginError::invalid_argument("record payload is missing '_id'"))?;

    let data = obj
        .iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(Record {
        id: RecordId::parse(id_str)?,
        owner_id: string_field(obj, "_ownerID"),
        acl: obj.get("_access").filter(|v| !v.is_null()).cloned(),
        created_at: date_field(obj, "_created_at")?,
        created_by: string_field(obj, "_created_by"),
        updated_at: date_field(obj, "_updated_at")?,
        updated_by: string_field(obj, "_updated_by"),
        data,
    })
}

/// Deserialize a record, treating `null`/absent payloads as no record.
pub fn deserialize_or_none(value: Option<&Value>) -> Result<Option<Record>, PluginError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => deserialize_record(v).map(Some),
    }
}

fn rfc3339(dt: &DateTime<Utc>) -> Value {
    Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Serialize a record back to its wire object form.
pub fn serialize_record(record: &Record) -> Value {
    let mut obj = Map::new();
    obj.insert("_id".to_string(), Value::String(record.id.to_string()));
    if let Some(owner) = &record.owner_id {
        obj.insert("_ownerID".to_string(), Value::String(owner.clone()));
    }
    if let Some(acl) = &record.acl {
        obj.insert("_access".to_string(), acl.clone());
    }
    if let Some(at) = &record.created_at {
        obj.insert("_created_at".to_string(), rfc3339(at));
    }
    if let Some(by) = &record.created_by {
        obj.insert("_created_by".to_string(), Value::String(by.clone()));
    }
    if let Some(at) = &record.updated_at {
        obj.insert("_updated_at".to_string(), rfc3339(at));
    }
    if let Some(by) = &record.updated_by {
        obj.insert("_updated_by".to_string(), Value::String(by.clone()));
    }
    for (k, v) in &record.data {
        obj.insert(k.clone(), v.clone());
    }
    Value::Object(obj)
}

/// Extract the timestamp from a `{"$type": "date", "$date": ...}` value.
pub fn date_value(value: &Value) -> Option<DateTime<Utc>> {
    let obj = value.as_object()?;
    if obj.get("$type")?.as_str()? != "date" {
        return None;
    }
    obj.get("$date")
        .and_then(Value::as_str)
        .and_then(|s| parse_date_str(s).ok())
}

/// Build a `$type`-tagged date value.
pub fn encode_date(dt: &DateTime<Utc>) -> Value {
    json!({ "$type": "date", "$date": dt.to_rfc3339_opts(SecondsFormat::Millis, true) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note() -> Value {
        json!({
            "_id": "note/99A02909",
            "_ownerID": "user-1",
            "_access": [{"level": "read", "public": true}],
            "_created_at": "2024-05-01T08:00:00.000Z",
            "title": "hello",
            "due": {"$type": "date", "$date": "2024-06-01T00:00:00.000Z"},
            "attachment": {"$type": "asset", "$name": "a.png"},
        })
    }

    #[test]
    fn test_deserialize_splits_reserved_keys() {
        let record = deserialize_record(&note()).unwrap();
        assert_eq!(record.id, RecordId::new("note", "99A02909"));
        assert_eq!(record.owner_id.as_deref(), Some("user-1"));
        assert!(record.created_at.is_some());
        assert_eq!(record.get("title"), Some(&json!("hello")));
        // Reserved keys never leak into user data.
        assert!(record.get("_id").is_none());
        // Tagged values other than $date pass through untouched.
        assert_eq!(record.get("attachment").unwrap()["$type"], "asset");
    }

    #[test]
    fn test_serialize_roundtrip() {
        let record = deserialize_record(&note()).unwrap();
        let reparsed = deserialize_record(&serialize_record(&record)).unwrap();
        assert_eq!(reparsed, record);
    }

    #[test]
    fn test_deserialize_or_none() {
        assert_eq!(deserialize_or_none(None).unwrap(), None);
        assert_eq!(deserialize_or_none(Some(&Value::Null)).unwrap(), None);
        assert!(deserialize_or_none(Some(&note())).unwrap().is_some());
    }

    #[test]
    fn test_malformed_id_is_invalid_argument() {
        let err = RecordId::parse("no-slash-here").unwrap_err();
        assert_eq!(err.code, crate::error::code::INVALID_ARGUMENT);
    }

    #[test]
    fn test_date_value_helpers() {
        let dt = date_value(&json!({"$type": "date", "$date": "2024-06-01T00:00:00.000Z"}))
            .unwrap();
        assert_eq!(encode_date(&dt)["$date"], "2024-06-01T00:00:00.000Z");
        assert_eq!(date_value(&json!({"$type": "asset"})), None);
        assert_eq!(date_value(&json!(42)), None);
    }
}
