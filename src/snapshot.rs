// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # HTTP Request Snapshots
//!
//! A snapshot of the HTTP call that triggered an event. Snapshots can only be
//! built through [`HttpSnapshot::sanitize`], which replaces sensitive headers
//! and body fields with [`REDACTED`], so an unsanitized snapshot never reaches
//! serialization.

use serde::Serialize;
use serde_json::{Map, Value};

pub const REDACTED: &str = "[REDACTED]";

/// Header names whose values are never recorded.
pub const SENSITIVE_HEADERS: [&str; 4] = [
    "authorization",
    "cookie",
    "set-cookie",
    "proxy-authorization",
];

/// Body field names whose values are never recorded, at any nesting depth.
pub const SENSITIVE_BODY_FIELDS: [&str; 3] = ["password", "token", "secret"];

/// Request data as captured, before redaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawHttpRequest {
    pub method: String,
    pub path: String,
    pub query: Map<String, Value>,
    pub body: Value,
    pub headers: Map<String, Value>,
    pub ip: Option<String>,
}

/// Redacted request snapshot carried by an envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpSnapshot {
    method: String,
    path: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    query: Map<String, Value>,
    #[serde(skip_serializing_if = "Value::is_null")]
    body: Value,
    #[serde(skip_serializing_if = "Map::is_empty")]
    headers: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
}

impl HttpSnapshot {
    /// Builds a snapshot from `raw`, redacting sensitive headers and body
    /// fields.
    pub fn sanitize(raw: RawHttpRequest) -> Self {
        HttpSnapshot {
            method: raw.method,
            path: raw.path,
            query: raw.query,
            body: redact_body(raw.body),
            headers: redact_headers(raw.headers),
            ip: raw.ip,
        }
    }

    /// Builds a snapshot from loosely-typed inbound JSON. Returns `None` when
    /// `value` is not an object.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut obj) = value else {
            return None;
        };

        let mut text = |key: &str| match obj.remove(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };
        let method = text("method").unwrap_or_default();
        let path = text("path").or_else(|| text("url")).unwrap_or_default();
        let ip = text("ip");

        let mut object = |key: &str| match obj.remove(key) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let query = object("query");
        let headers = object("headers");

        Some(Self::sanitize(RawHttpRequest {
            method,
            path,
            query,
            body: obj.remove("body").unwrap_or(Value::Null),
            headers,
            ip,
        }))
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &Map<String, Value> {
        &self.query
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn headers(&self) -> &Map<String, Value> {
        &self.headers
    }

    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    /// Case-insensitive lookup of a string header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, value)| value.as_str())
    }
}

fn is_sensitive(key: &str, deny_list: &[&str]) -> bool {
    deny_list.iter().any(|name| key.eq_ignore_ascii_case(name))
}

fn redact_headers(headers: Map<String, Value>) -> Map<String, Value> {
    headers
        .into_iter()
        .map(|(key, value)| {
            if is_sensitive(&key, &SENSITIVE_HEADERS) {
                (key, Value::String(REDACTED.to_owned()))
            } else {
                (key, value)
            }
        })
        .collect()
}

fn redact_body(body: Value) -> Value {
    match body {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    if is_sensitive(&key, &SENSITIVE_BODY_FIELDS) {
                        (key, Value::String(REDACTED.to_owned()))
                    } else {
                        (key, redact_body(value))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact_body).collect()),
        other => other,
    }
}
