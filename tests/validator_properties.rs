//! Property tests: validation rejects bad input and never panics

use proptest::prelude::*;
use serde_json::{json, Value};

use news_ingest::validator::{validate, RejectReason};
use news_ingest::RawMessage;

const REQUIRED: [&str; 6] = ["id", "headline", "source", "url", "created_at", "updated_at"];

fn base_message() -> Value {
    json!({
        "T": "n",
        "id": 24803233,
        "headline": "Markets close higher",
        "summary": "",
        "author": "Benzinga Newsdesk",
        "content": "",
        "symbols": ["SPY"],
        "source": "benzinga",
        "url": "https://www.benzinga.com/news/24803233",
        "created_at": "2022-01-05T22:00:00Z",
        "updated_at": "2022-01-05T22:00:01Z",
    })
}

fn wrong_typed_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Bool(true)),
        Just(json!([1, 2])),
        Just(json!({"nested": "object"})),
        Just(json!(1.5)),
    ]
}

proptest! {
    #[test]
    fn arbitrary_text_never_panics(text in ".*") {
        let _ = validate(&RawMessage::Text(text));
    }

    #[test]
    fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let _ = validate(&RawMessage::Binary(bytes.into()));
    }

    #[test]
    fn missing_required_field_is_rejected(index in 0..REQUIRED.len(), as_null in any::<bool>()) {
        let field = REQUIRED[index];
        let mut message = base_message();
        let obj = message.as_object_mut().unwrap();
        if as_null {
            obj.insert(field.to_string(), Value::Null);
        } else {
            obj.remove(field);
        }

        prop_assert_eq!(
            validate(&message.into()),
            Err(RejectReason::MissingField(field))
        );
    }

    #[test]
    fn wrong_type_on_required_field_is_rejected(
        index in 0..REQUIRED.len(),
        value in wrong_typed_value(),
    ) {
        let mut message = base_message();
        message[REQUIRED[index]] = value;
        prop_assert!(validate(&message.into()).is_err());
    }

    #[test]
    fn malformed_timestamps_are_rejected(garbage in "[a-z0-9 :/-]{1,24}") {
        prop_assume!(chrono::DateTime::parse_from_rfc3339(&garbage).is_err());
        let mut message = base_message();
        message["created_at"] = Value::String(garbage);
        let rejected = matches!(
            validate(&message.into()),
            Err(RejectReason::BadTimestamp { field: "created_at", .. })
        );
        prop_assert!(rejected);
    }

    #[test]
    fn well_formed_messages_keep_every_field(
        id in any::<i64>(),
        headline in "[A-Za-z][A-Za-z0-9 ]{0,40}",
        symbols in proptest::collection::vec("[A-Z]{1,5}", 0..6),
        created_secs in 0i64..4_000_000_000,
        lag_secs in 0i64..86_400,
    ) {
        let created = chrono::DateTime::from_timestamp(created_secs, 0).unwrap();
        let updated = created + chrono::Duration::seconds(lag_secs);
        let mut message = base_message();
        message["id"] = json!(id);
        message["headline"] = json!(headline);
        message["symbols"] = json!(symbols);
        message["created_at"] = json!(created.to_rfc3339());
        message["updated_at"] = json!(updated.to_rfc3339());

        let event = validate(&message.into()).unwrap();
        prop_assert_eq!(event.id, id);
        prop_assert_eq!(event.headline, headline);
        prop_assert_eq!(event.symbols, symbols);
        prop_assert_eq!(event.created_at, created);
        prop_assert_eq!(event.updated_at, updated);
    }
}
