// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Store
//!
//! The query interface the logger service writes received envelopes into,
//! plus an in-memory implementation.
//!
//! Delivery is at-least-once, so a store must accept the same envelope more
//! than once. [`MemoryEventStore`] keys entries by timestamp and correlation
//! id, which makes a repeated write overwrite the first. Days are UTC calendar
//! days, from 00:00:00.000 to 23:59:59.999.

use crate::{
    consumer::{EventHandler, ReceivedEvent},
    envelope::{Envelope, EventType, LogLevel},
    errors::StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
#[cfg(test)]
use mockall::automock;
use std::{collections::BTreeMap, ops::Bound, sync::Arc};
use tokio::sync::RwLock;
use tracing::debug;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Stores `envelope`; storing the same envelope twice keeps one copy.
    async fn store_event(&self, envelope: &Envelope) -> Result<(), StoreError>;

    async fn query_by_day(&self, day: NaiveDate) -> Result<Vec<Envelope>, StoreError>;

    /// Both days are inclusive.
    async fn query_by_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Envelope>, StoreError>;

    /// Entries whose log level or event type is `kind`.
    async fn query_by_type(&self, kind: &str) -> Result<Vec<Envelope>, StoreError>;
}

type EntryKey = (DateTime<Utc>, String);

#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<BTreeMap<EntryKey, Envelope>>,
}

impl MemoryEventStore {
    pub fn new() -> Arc<MemoryEventStore> {
        Arc::new(MemoryEventStore::default())
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    async fn between(&self, start: NaiveDate, end: NaiveDate) -> Vec<Envelope> {
        let lower = Bound::Included((day_start(start), String::new()));
        let upper = match end.succ_opt() {
            Some(next) => Bound::Excluded((day_start(next), String::new())),
            None => Bound::Unbounded,
        };

        self.events
            .read()
            .await
            .range((lower, upper))
            .map(|(_, envelope)| envelope.clone())
            .collect()
    }
}

fn day_start(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

fn is_known_type(kind: &str) -> bool {
    kind.parse::<LogLevel>().is_ok() || kind.parse::<EventType>().is_ok()
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn store_event(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let key = (envelope.timestamp, envelope.correlation_id.clone());
        let replaced = self
            .events
            .write()
            .await
            .insert(key, envelope.clone())
            .is_some();

        debug!(
            correlation_id = %envelope.correlation_id,
            replaced,
            "event stored"
        );

        Ok(())
    }

    async fn query_by_day(&self, day: NaiveDate) -> Result<Vec<Envelope>, StoreError> {
        Ok(self.between(day, day).await)
    }

    async fn query_by_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Envelope>, StoreError> {
        if end < start {
            return Err(StoreError::InvalidRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }

        Ok(self.between(start, end).await)
    }

    async fn query_by_type(&self, kind: &str) -> Result<Vec<Envelope>, StoreError> {
        if !is_known_type(kind) {
            return Err(StoreError::UnknownType(kind.to_owned()));
        }

        Ok(self
            .events
            .read()
            .await
            .values()
            .filter(|envelope| envelope.category().eq_ignore_ascii_case(kind))
            .cloned()
            .collect())
    }
}

/// Writes every received envelope into a store.
pub struct StoringHandler {
    store: Arc<dyn EventStore>,
}

impl StoringHandler {
    pub fn new(store: Arc<dyn EventStore>) -> Arc<StoringHandler> {
        Arc::new(StoringHandler { store })
    }
}

#[async_trait]
impl EventHandler for StoringHandler {
    async fn handle(&self, event: &ReceivedEvent) -> anyhow::Result<()> {
        self.store.store_event(&event.envelope).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventBody;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(rfc3339: &str, correlation_id: &str, body: EventBody) -> Envelope {
        let mut envelope = Envelope::new("data-service-a", body).with_correlation_id(correlation_id);
        envelope.timestamp = DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc);
        envelope
    }

    fn info(message: &str) -> EventBody {
        EventBody::Log {
            level: LogLevel::Info,
            message: message.to_owned(),
        }
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn repeated_writes_keep_one_entry() {
        let store = MemoryEventStore::new();
        let envelope = at("2025-03-01T10:00:00.000Z", "corr-1", info("once"));

        store.store_event(&envelope).await.unwrap();
        store.store_event(&envelope).await.unwrap();

        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn same_timestamp_different_correlation_ids_are_distinct() {
        let store = MemoryEventStore::new();

        store
            .store_event(&at("2025-03-01T10:00:00.000Z", "corr-1", info("a")))
            .await
            .unwrap();
        store
            .store_event(&at("2025-03-01T10:00:00.000Z", "corr-2", info("b")))
            .await
            .unwrap();

        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn day_query_covers_the_whole_calendar_day() {
        let store = MemoryEventStore::new();
        for (ts, id) in [
            ("2025-02-28T23:59:59.999Z", "before"),
            ("2025-03-01T00:00:00.000Z", "first"),
            ("2025-03-01T23:59:59.999Z", "last"),
            ("2025-03-02T00:00:00.000Z", "after"),
        ] {
            store.store_event(&at(ts, id, info(id))).await.unwrap();
        }

        let found = store.query_by_day(day("2025-03-01")).await.unwrap();
        let ids: Vec<_> = found.iter().map(|e| e.correlation_id.as_str()).collect();

        assert_eq!(ids, vec!["first", "last"]);
    }

    #[tokio::test]
    async fn range_query_is_inclusive_and_ordered() {
        let store = MemoryEventStore::new();
        for (ts, id) in [
            ("2025-03-03T08:00:00.000Z", "third"),
            ("2025-03-01T08:00:00.000Z", "first"),
            ("2025-03-04T08:00:00.000Z", "outside"),
            ("2025-03-02T08:00:00.000Z", "second"),
        ] {
            store.store_event(&at(ts, id, info(id))).await.unwrap();
        }

        let found = store
            .query_by_range(day("2025-03-01"), day("2025-03-03"))
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|e| e.correlation_id.as_str()).collect();

        assert_eq!(ids, vec!["first", "second", "third"]);
        assert!(matches!(
            store.query_by_range(day("2025-03-03"), day("2025-03-01")).await,
            Err(StoreError::InvalidRange { .. })
        ));
    }

    #[tokio::test]
    async fn type_query_matches_levels_and_event_types() {
        let store = MemoryEventStore::new();
        store
            .store_event(&at("2025-03-01T08:00:00.000Z", "log", info("started")))
            .await
            .unwrap();
        store
            .store_event(&at("2025-03-01T09:00:00.000Z", "err", EventBody::error("boom")))
            .await
            .unwrap();

        let errors = store.query_by_type("ERROR").await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].correlation_id, "err");

        assert_eq!(store.query_by_type("info").await.unwrap().len(), 1);
        assert_eq!(
            store.query_by_type("audit").await,
            Err(StoreError::UnknownType("audit".to_owned()))
        );
    }

    #[tokio::test]
    async fn storing_handler_writes_the_envelope() {
        let envelope = Envelope::log("data-service-a", LogLevel::Info, "stored")
            .with_correlation_id("corr-7");
        let event = ReceivedEvent {
            routing_key: "data.service.logs".to_owned(),
            redelivered: false,
            envelope,
            payload: json!({}),
        };

        let mut store = MockEventStore::new();
        store
            .expect_store_event()
            .withf(|envelope| envelope.correlation_id == "corr-7")
            .times(1)
            .returning(|_| Ok(()));

        let handler = StoringHandler::new(Arc::new(store));
        assert!(handler.handle(&event).await.is_ok());
    }

    #[tokio::test]
    async fn storing_handler_surfaces_store_failures() {
        let event = ReceivedEvent {
            routing_key: "data.service.logs".to_owned(),
            redelivered: true,
            envelope: Envelope::log("svc", LogLevel::Info, "x"),
            payload: json!({}),
        };

        let mut store = MockEventStore::new();
        store
            .expect_store_event()
            .returning(|_| Err(StoreError::Storage("disk full".to_owned())));

        let handler = StoringHandler::new(Arc::new(store));
        assert!(handler.handle(&event).await.is_err());
    }

    #[test]
    fn day_start_is_utc_midnight() {
        assert_eq!(
            day_start(day("2025-03-01")),
            Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
        );
    }
}
