// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Propagates trace context through AMQP message headers: the publisher injects
//! the current context next to the `x-service` header, the consumer extracts it
//! and opens a consumer span per delivery.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Adapter for injecting and extracting OpenTelemetry context from AMQP
/// headers.
pub(crate) struct AmqpHeaderPropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> AmqpHeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for AmqpHeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for AmqpHeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.get(key)? {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .map_err(|e| error!("Error decoding header value {:?}", e))
                .ok(),
            AMQPValue::ShortString(value) => Some(value.as_str()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Injects the current trace context into `headers` with the global
/// propagator.
pub(crate) fn inject_current(headers: &mut BTreeMap<ShortString, AMQPValue>) {
    let ctx = Context::current();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut AmqpHeaderPropagator::new(headers))
    });
}

/// Extracts the remote context from the delivery headers and opens a consumer
/// span named `name` under it.
pub(crate) fn new_span(props: &AMQPProperties, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let mut headers = props
        .headers()
        .clone()
        .unwrap_or_default()
        .inner()
        .clone();

    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&AmqpHeaderPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::{
        propagation::TextMapPropagator,
        trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState},
    };
    use opentelemetry_sdk::propagation::TraceContextPropagator;

    #[test]
    fn trace_context_survives_amqp_headers() {
        let trace_id = TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap();
        let span_id = SpanId::from_hex("00f067aa0ba902b7").unwrap();
        let ctx = Context::new().with_remote_span_context(SpanContext::new(
            trace_id,
            span_id,
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        ));

        let propagator = TraceContextPropagator::new();
        let mut headers = BTreeMap::new();
        propagator.inject_context(&ctx, &mut AmqpHeaderPropagator::new(&mut headers));

        assert!(headers.contains_key("traceparent"));

        let extracted = propagator.extract(&AmqpHeaderPropagator::new(&mut headers));
        let span = extracted.span();
        assert_eq!(span.span_context().trace_id(), trace_id);
        assert_eq!(span.span_context().span_id(), span_id);
    }

    #[test]
    fn only_string_headers_are_extracted() {
        let mut headers = BTreeMap::new();
        headers.insert(ShortString::from("traceparent"), AMQPValue::Boolean(true));

        headers.insert(
            ShortString::from("tracestate"),
            AMQPValue::ShortString(ShortString::from("vendor=1")),
        );

        let propagator = AmqpHeaderPropagator::new(&mut headers);
        assert_eq!(propagator.get("traceparent"), None);
        assert_eq!(propagator.get("tracestate"), Some("vendor=1"));
        assert_eq!(propagator.keys(), vec!["traceparent", "tracestate"]);
    }
}
