//! Event validation: untrusted feed payloads in, [`NewsEvent`] out
//!
//! The feed may hand over an already-decoded JSON element, a text frame or
//! a binary frame. All three are normalized to a single JSON object and then
//! checked field by field. Every failure is reported as a [`RejectReason`];
//! nothing in here panics on hostile input.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{NewsEvent, RawMessage};

/// Message type tag used by the provider for news items
const NEWS_TYPE_TAG: &str = "n";

/// Why a raw message was not turned into a [`NewsEvent`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("payload is not valid JSON: {0}")]
    Undecodable(String),

    #[error("payload is not a JSON object (got {0})")]
    NotAnObject(&'static str),

    /// Control or other non-news message that reached the pipeline
    #[error("not a news message (type {0:?})")]
    NotNews(String),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` has wrong type: expected {expected}, got {found}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("field `{field}` is not an RFC 3339 timestamp: {value:?}")]
    BadTimestamp { field: &'static str, value: String },

    #[error("updated_at ({updated_at}) precedes created_at ({created_at})")]
    TimestampOrder {
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    },
}

/// Validate one inbound message.
pub fn validate(raw: &RawMessage) -> Result<NewsEvent, RejectReason> {
    match raw {
        RawMessage::Structured(value) => validate_value(value),
        RawMessage::Text(text) => {
            let value: Value = serde_json::from_str(text)
                .map_err(|e| RejectReason::Undecodable(e.to_string()))?;
            validate_value(&value)
        }
        RawMessage::Binary(bytes) => {
            let value: Value = serde_json::from_slice(bytes)
                .map_err(|e| RejectReason::Undecodable(e.to_string()))?;
            validate_value(&value)
        }
    }
}

fn validate_value(value: &Value) -> Result<NewsEvent, RejectReason> {
    let obj = as_object(value)?;

    match obj.get("T") {
        None => {}
        Some(Value::String(tag)) if tag == NEWS_TYPE_TAG => {}
        Some(Value::String(tag)) => return Err(RejectReason::NotNews(tag.clone())),
        Some(other) => {
            return Err(RejectReason::WrongType {
                field: "T",
                expected: "string",
                found: type_name(other),
            })
        }
    }

    let id = required_i64(obj, "id")?;

    let headline = required_str(obj, "headline")?;
    if headline.trim().is_empty() {
        return Err(RejectReason::EmptyField("headline"));
    }

    let summary = optional_str(obj, "summary")?;
    let author = optional_str(obj, "author")?;
    let content = optional_str(obj, "content")?;
    let symbols = optional_str_list(obj, "symbols")?;
    let source = required_str(obj, "source")?;
    let url = required_str(obj, "url")?;

    let created_at = required_timestamp(obj, "created_at")?;
    let updated_at = required_timestamp(obj, "updated_at")?;
    if updated_at < created_at {
        return Err(RejectReason::TimestampOrder {
            created_at,
            updated_at,
        });
    }

    Ok(NewsEvent {
        id,
        headline,
        summary,
        author,
        content,
        symbols,
        source,
        url,
        created_at,
        updated_at,
    })
}

/// Accepts an object, or a one-element array wrapping an object (the
/// provider batches elements into arrays on the wire).
fn as_object(value: &Value) -> Result<&Map<String, Value>, RejectReason> {
    match value {
        Value::Object(obj) => Ok(obj),
        Value::Array(items) if items.len() == 1 => match &items[0] {
            Value::Object(obj) => Ok(obj),
            other => Err(RejectReason::NotAnObject(type_name(other))),
        },
        other => Err(RejectReason::NotAnObject(type_name(other))),
    }
}

fn present<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Option<&'a Value> {
    obj.get(field).filter(|v| !v.is_null())
}

fn required_i64(obj: &Map<String, Value>, field: &'static str) -> Result<i64, RejectReason> {
    let value = present(obj, field).ok_or(RejectReason::MissingField(field))?;
    value.as_i64().ok_or(RejectReason::WrongType {
        field,
        expected: "integer",
        found: type_name(value),
    })
}

fn required_str(obj: &Map<String, Value>, field: &'static str) -> Result<String, RejectReason> {
    let value = present(obj, field).ok_or(RejectReason::MissingField(field))?;
    expect_str(value, field).map(str::to_string)
}

/// Missing or null optional text fields become empty strings.
fn optional_str(obj: &Map<String, Value>, field: &'static str) -> Result<String, RejectReason> {
    match present(obj, field) {
        None => Ok(String::new()),
        Some(value) => expect_str(value, field).map(str::to_string),
    }
}

fn optional_str_list(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<Vec<String>, RejectReason> {
    let items = match present(obj, field) {
        None => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(RejectReason::WrongType {
                field,
                expected: "array of strings",
                found: type_name(other),
            })
        }
    };

    items
        .iter()
        .map(|item| match item {
            Value::String(s) => Ok(s.clone()),
            other => Err(RejectReason::WrongType {
                field,
                expected: "array of strings",
                found: type_name(other),
            }),
        })
        .collect()
}

fn required_timestamp(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<DateTime<Utc>, RejectReason> {
    let value = present(obj, field).ok_or(RejectReason::MissingField(field))?;
    let text = expect_str(value, field)?;
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| RejectReason::BadTimestamp {
            field,
            value: text.to_string(),
        })
}

fn expect_str<'a>(value: &'a Value, field: &'static str) -> Result<&'a str, RejectReason> {
    value.as_str().ok_or(RejectReason::WrongType {
        field,
        expected: "string",
        found: type_name(value),
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "T": "n",
            "id": 24918784,
            "headline": "Fed raises rates",
            "summary": "The Federal Reserve raised its benchmark rate.",
            "author": "Benzinga Newsdesk",
            "content": "<p>Full story</p>",
            "symbols": ["SPY", "QQQ"],
            "source": "benzinga",
            "url": "https://www.benzinga.com/news/24918784",
            "created_at": "2024-01-05T22:00:00Z",
            "updated_at": "2024-01-05T22:00:01Z"
        })
    }

    fn without(field: &str) -> Value {
        let mut value = sample();
        value.as_object_mut().unwrap().remove(field);
        value
    }

    fn with(field: &str, replacement: Value) -> Value {
        let mut value = sample();
        value.as_object_mut().unwrap().insert(field.to_string(), replacement);
        value
    }

    #[test]
    fn test_structured_message_is_accepted() {
        let event = validate(&RawMessage::Structured(sample())).unwrap();

        assert_eq!(event.id, 24918784);
        assert_eq!(event.headline, "Fed raises rates");
        assert_eq!(event.symbols, vec!["SPY", "QQQ"]);
        assert_eq!(event.source, "benzinga");
        assert_eq!(
            event.created_at,
            Utc.with_ymd_and_hms(2024, 1, 5, 22, 0, 0).unwrap()
        );
        assert_eq!(
            event.updated_at,
            Utc.with_ymd_and_hms(2024, 1, 5, 22, 0, 1).unwrap()
        );
    }

    #[test]
    fn test_text_and_binary_normalize_to_same_event() {
        let structured = validate(&RawMessage::Structured(sample())).unwrap();
        let text = validate(&RawMessage::Text(sample().to_string())).unwrap();
        let binary =
            validate(&RawMessage::Binary(sample().to_string().into_bytes().into())).unwrap();

        assert_eq!(structured, text);
        assert_eq!(structured, binary);
    }

    #[test]
    fn test_single_element_batch_is_unwrapped() {
        let batch = json!([sample()]);
        let event = validate(&RawMessage::Structured(batch)).unwrap();
        assert_eq!(event.id, 24918784);
    }

    #[test]
    fn test_offset_timestamps_are_normalized_to_utc() {
        let value = with("created_at", json!("2024-01-05T17:00:00-05:00"));
        let event = validate(&RawMessage::Structured(value)).unwrap();
        assert_eq!(
            event.created_at,
            Utc.with_ymd_and_hms(2024, 1, 5, 22, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_optional_fields_default_to_empty() {
        let mut value = sample();
        let obj = value.as_object_mut().unwrap();
        obj.remove("summary");
        obj.remove("author");
        obj.insert("content".into(), Value::Null);
        obj.insert("symbols".into(), json!([]));

        let event = validate(&RawMessage::Structured(value)).unwrap();
        assert_eq!(event.summary, "");
        assert_eq!(event.author, "");
        assert_eq!(event.content, "");
        assert!(event.symbols.is_empty());
    }

    #[test]
    fn test_missing_required_fields_are_rejected() {
        for field in ["id", "headline", "source", "url", "created_at", "updated_at"] {
            let result = validate(&RawMessage::Structured(without(field)));
            assert_eq!(result, Err(RejectReason::MissingField(field)), "field {field}");
        }
    }

    #[test]
    fn test_null_required_field_counts_as_missing() {
        let result = validate(&RawMessage::Structured(with("headline", Value::Null)));
        assert_eq!(result, Err(RejectReason::MissingField("headline")));
    }

    #[test]
    fn test_blank_headline_is_rejected() {
        let result = validate(&RawMessage::Structured(with("headline", json!("   "))));
        assert_eq!(result, Err(RejectReason::EmptyField("headline")));
    }

    #[test]
    fn test_wrong_types_are_rejected() {
        let cases = [
            ("id", json!("24918784"), "integer"),
            ("id", json!(1.5), "integer"),
            ("headline", json!(42), "string"),
            ("symbols", json!("SPY"), "array of strings"),
            ("symbols", json!(["SPY", 7]), "array of strings"),
            ("created_at", json!(1704492000), "string"),
        ];

        for (field, value, expected) in cases {
            match validate(&RawMessage::Structured(with(field, value.clone()))) {
                Err(RejectReason::WrongType {
                    field: f,
                    expected: e,
                    ..
                }) => {
                    assert_eq!(f, field);
                    assert_eq!(e, expected);
                }
                other => panic!("{field}={value}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_malformed_timestamp_is_rejected() {
        let result = validate(&RawMessage::Structured(with(
            "updated_at",
            json!("yesterday at noon"),
        )));
        assert_eq!(
            result,
            Err(RejectReason::BadTimestamp {
                field: "updated_at",
                value: "yesterday at noon".into()
            })
        );
    }

    #[test]
    fn test_updated_before_created_is_rejected() {
        let result = validate(&RawMessage::Structured(with(
            "updated_at",
            json!("2024-01-05T21:59:59Z"),
        )));
        assert!(matches!(result, Err(RejectReason::TimestampOrder { .. })));
    }

    #[test]
    fn test_control_messages_are_not_news() {
        let control = json!({"T": "subscription", "news": ["*"]});
        assert_eq!(
            validate(&RawMessage::Structured(control)),
            Err(RejectReason::NotNews("subscription".into()))
        );
    }

    #[test]
    fn test_non_object_payloads_are_rejected() {
        assert_eq!(
            validate(&RawMessage::Text("not json at all".into())).map(|e| e.id),
            Err(RejectReason::Undecodable(
                serde_json::from_str::<Value>("not json at all")
                    .unwrap_err()
                    .to_string()
            ))
        );
        assert_eq!(
            validate(&RawMessage::Structured(json!([1, 2]))),
            Err(RejectReason::NotAnObject("array"))
        );
        assert_eq!(
            validate(&RawMessage::Structured(json!("news"))),
            Err(RejectReason::NotAnObject("string"))
        );
    }
}
