// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use event_pipeline::{
    consumer::{process_delivery, DeliveryInfo, Disposition, EventHandler},
    envelope::{Envelope, EventType, WireProperties},
    publisher::OutboundMessage,
    snapshot::{HttpSnapshot, RawHttpRequest, REDACTED},
    store::{EventStore, MemoryEventStore, StoringHandler},
};
use serde_json::{json, Value};
use std::sync::Arc;

fn is_generated_correlation_id(id: &str) -> bool {
    let mut parts = id.splitn(3, '-');
    parts.next() == Some("corr")
        && parts
            .next()
            .is_some_and(|ms| !ms.is_empty() && ms.chars().all(|c| c.is_ascii_digit()))
        && parts
            .next()
            .is_some_and(|t| !t.is_empty() && t.chars().all(|c| c.is_ascii_alphanumeric()))
}

/// Publisher encoding, then consumer processing into a fresh store.
async fn deliver(message: &OutboundMessage, routing_key: &str) -> (Disposition, Arc<MemoryEventStore>) {
    let store = MemoryEventStore::new();
    let handlers: Vec<Arc<dyn EventHandler>> = vec![StoringHandler::new(store.clone())];

    let info = DeliveryInfo::new(routing_key, false);
    let disposition = process_delivery(&handlers, &info, &message.payload).await;
    (disposition, store)
}

#[tokio::test]
async fn published_log_is_stored_under_its_day() {
    let envelope = Envelope::normalize(
        json!({
            "service": "data-service-a",
            "level": "info",
            "message": "City processing completed",
            "metadata": { "totalCities": 100 }
        }),
        None,
    )
    .unwrap();
    assert!(envelope.correlation_id.is_empty());

    let message = OutboundMessage::encode(&envelope, None).unwrap();
    let (disposition, store) = deliver(&message, "data.service.logs").await;
    assert_eq!(disposition, Disposition::Ack);

    let found = store
        .query_by_day(envelope.timestamp.date_naive())
        .await
        .unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].body.message(), Some("City processing completed"));
    assert_eq!(found[0].metadata["totalCities"], json!(100));
    assert_eq!(found[0].service, "data-service-a");
    assert_eq!(found[0].correlation_id, message.correlation_id);
    assert!(is_generated_correlation_id(&found[0].correlation_id));
}

#[tokio::test]
async fn caller_supplied_correlation_id_reaches_the_consumer() {
    let envelope = Envelope::normalize(
        json!({ "service": "data-service-a", "eventType": "response", "responseTime": 18 }),
        None,
    )
    .unwrap();

    let message = OutboundMessage::encode(&envelope, Some("order-1234")).unwrap();
    let (disposition, store) = deliver(&message, "data.service.logs").await;
    assert_eq!(disposition, Disposition::Ack);

    let found = store.query_by_type("response").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].correlation_id, "order-1234");
    assert_eq!(found[0].body.status_code(), Some(200));
}

#[tokio::test]
async fn redacted_values_never_cross_the_wire() {
    let snapshot = HttpSnapshot::sanitize(RawHttpRequest {
        method: "POST".to_owned(),
        path: "/login".to_owned(),
        body: json!({ "user": "ada", "password": "secret" }),
        headers: match json!({ "authorization": "Bearer xyz" }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        },
        ..RawHttpRequest::default()
    });
    let envelope = Envelope::normalize(
        json!({ "service": "data-service-a", "eventType": "request", "message": "POST /login" }),
        None,
    )
    .unwrap()
    .with_http_request(snapshot);

    let message = OutboundMessage::encode(&envelope, None).unwrap();
    let wire = String::from_utf8(message.payload.clone()).unwrap();
    assert!(!wire.contains("Bearer xyz"));
    assert!(!wire.contains("\"secret\""));

    let (_, store) = deliver(&message, "data.service.logs").await;
    let stored = store.query_by_type("request").await.unwrap();
    let request = stored[0].http_request.as_ref().unwrap();

    assert_eq!(request.header("Authorization"), Some(REDACTED));
    assert_eq!(request.body()["password"], REDACTED);
    assert_eq!(request.body()["user"], "ada");
}

#[tokio::test]
async fn routing_key_types_events_without_an_explicit_type() {
    let envelope = Envelope::normalize(json!({ "service": "data-service-a", "message": "db down" }), Some(EventType::Error))
        .unwrap();
    let mut payload: Value = serde_json::from_slice(&OutboundMessage::encode(&envelope, None).unwrap().payload).unwrap();
    payload.as_object_mut().unwrap().remove("eventType");
    payload.as_object_mut().unwrap().remove("statusCode");

    let store = MemoryEventStore::new();
    let handlers: Vec<Arc<dyn EventHandler>> = vec![StoringHandler::new(store.clone())];
    let disposition = process_delivery(
        &handlers,
        &DeliveryInfo::new("data.service.error", false),
        payload.to_string().as_bytes(),
    )
    .await;

    assert_eq!(disposition, Disposition::Ack);
    let errors = store.query_by_type("error").await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].body.status_code(), Some(500));
}

#[tokio::test]
async fn malformed_delivery_stores_nothing() {
    let store = MemoryEventStore::new();
    let handlers: Vec<Arc<dyn EventHandler>> = vec![StoringHandler::new(store.clone())];

    let info = DeliveryInfo::new("data.service.logs", false);
    let disposition = process_delivery(&handlers, &info, b"plain text").await;

    assert_eq!(disposition, Disposition::DeadLetter);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn redelivery_of_a_bare_body_is_stored_once() {
    let store = MemoryEventStore::new();
    let handlers: Vec<Arc<dyn EventHandler>> = vec![StoringHandler::new(store.clone())];
    let properties = WireProperties {
        timestamp: Some(1_735_689_600_000),
        correlation_id: Some("corr-1735689600000-k2j4h5g6f".to_owned()),
    };
    let body = br#"{"service":"data-service-a","level":"warn","message":"slow upstream"}"#;

    for redelivered in [false, true] {
        let info = DeliveryInfo::new("data.service.logs", redelivered).with_properties(properties.clone());
        assert_eq!(process_delivery(&handlers, &info, body).await, Disposition::Ack);
    }

    assert_eq!(store.len().await, 1);
}
