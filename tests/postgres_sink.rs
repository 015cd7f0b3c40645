//! Round trip against a real PostgreSQL instance.
//!
//! Needs the `news_updates` table from `sql/news_updates.sql` and the
//! usual POSTGRES_* variables. Run with `cargo test -- --ignored`.

use chrono::{TimeZone, Utc};

use news_ingest::config::Config;
use news_ingest::sink::postgres::PostgresSink;
use news_ingest::sink::{PersistError, PersistenceSink};
use news_ingest::NewsEvent;

fn sink_from_env() -> PostgresSink {
    let mut config = Config::default();
    config
        .apply_env_from(|key| std::env::var(key).ok())
        .expect("valid POSTGRES_* environment");
    PostgresSink::new(&config.postgres).expect("pool configuration")
}

fn sample(id: i64) -> NewsEvent {
    NewsEvent {
        id,
        headline: "Fed raises rates".into(),
        summary: "Quarter-point hike".into(),
        author: "Staff".into(),
        content: "<p>body</p>".into(),
        symbols: vec!["SPY".into(), "QQQ".into()],
        source: "benzinga".into(),
        url: format!("https://example.com/{id}"),
        created_at: Utc.with_ymd_and_hms(2024, 3, 20, 18, 0, 0).unwrap(),
        updated_at: Utc.with_ymd_and_hms(2024, 3, 20, 18, 5, 0).unwrap(),
    }
}

#[tokio::test]
#[ignore] // requires a running PostgreSQL
async fn test_insert_fetch_and_duplicate() {
    let sink = sink_from_env();
    let id = Utc::now().timestamp_micros();
    let event = sample(id);

    sink.persist(&event).await.unwrap();
    assert_eq!(sink.fetch(id).await.unwrap(), Some(event.clone()));

    let err = sink.persist(&event).await.unwrap_err();
    assert!(matches!(err, PersistError::DuplicateKey(_)));

    sink.close().await;
}
