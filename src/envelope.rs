// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Envelope
//!
//! The message schema shared by the publisher and the consumer. The common
//! fields (service, correlation id, timestamp, metadata, request snapshot) are
//! factored out of [`EventBody`], which is keyed by event type.
//!
//! On the wire the envelope is flat camelCase JSON: log records carry a
//! `level`, structured events carry an `eventType`. Decoding always goes
//! through [`Envelope::normalize`], which accepts loosely-typed input and
//! applies the type-appropriate defaults.

use crate::{errors::EnvelopeError, snapshot::HttpSnapshot};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{de, ser::SerializeMap, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};

/// Service name used when an envelope does not carry one.
pub const DEFAULT_SERVICE: &str = "data-service";

/// Request headers a correlation id is pulled from, in priority order.
pub const CORRELATION_HEADERS: [&str; 3] = ["x-correlation-id", "x-request-id", "correlation-id"];

const TOKEN_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(EnvelopeError::InvalidField {
                field: "level",
                value: s.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Request,
    Response,
    Error,
    Info,
    Warning,
    Debug,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Request => "request",
            EventType::Response => "response",
            EventType::Error => "error",
            EventType::Info => "info",
            EventType::Warning => "warning",
            EventType::Debug => "debug",
        }
    }
}

impl FromStr for EventType {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "request" => Ok(EventType::Request),
            "response" => Ok(EventType::Response),
            "error" => Ok(EventType::Error),
            "info" => Ok(EventType::Info),
            "warning" => Ok(EventType::Warning),
            "debug" => Ok(EventType::Debug),
            _ => Err(EnvelopeError::InvalidField {
                field: "eventType",
                value: s.to_owned(),
            }),
        }
    }
}

/// Payload of an envelope, keyed by event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventBody {
    Log {
        level: LogLevel,
        message: String,
    },
    Request {
        message: Option<String>,
    },
    Response {
        status_code: u16,
        response_time_ms: Option<u64>,
        message: Option<String>,
    },
    Error {
        message: String,
        status_code: u16,
        stack: Option<String>,
    },
    Info {
        message: String,
    },
    Warning {
        message: String,
    },
    Debug {
        message: String,
    },
}

impl EventBody {
    pub fn response(status_code: u16) -> Self {
        EventBody::Response {
            status_code,
            response_time_ms: None,
            message: None,
        }
    }

    pub fn error(message: &str) -> Self {
        EventBody::Error {
            message: message.to_owned(),
            status_code: 500,
            stack: None,
        }
    }

    /// `None` for log records.
    pub fn event_type(&self) -> Option<EventType> {
        match self {
            EventBody::Log { .. } => None,
            EventBody::Request { .. } => Some(EventType::Request),
            EventBody::Response { .. } => Some(EventType::Response),
            EventBody::Error { .. } => Some(EventType::Error),
            EventBody::Info { .. } => Some(EventType::Info),
            EventBody::Warning { .. } => Some(EventType::Warning),
            EventBody::Debug { .. } => Some(EventType::Debug),
        }
    }

    /// The log level for log records, the event type otherwise.
    pub fn category(&self) -> &'static str {
        match self {
            EventBody::Log { level, .. } => level.as_str(),
            other => other
                .event_type()
                .map(|t| t.as_str())
                .unwrap_or_default(),
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            EventBody::Log { message, .. }
            | EventBody::Error { message, .. }
            | EventBody::Info { message }
            | EventBody::Warning { message }
            | EventBody::Debug { message } => Some(message.as_str()),
            EventBody::Request { message } | EventBody::Response { message, .. } => {
                message.as_deref()
            }
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            EventBody::Response { status_code, .. } | EventBody::Error { status_code, .. } => {
                Some(*status_code)
            }
            _ => None,
        }
    }
}

/// Message properties a delivered body falls back to when it lacks the
/// matching field, so every redelivery of one message decodes to the same
/// timestamp and correlation id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireProperties {
    /// Epoch milliseconds.
    pub timestamp: Option<u64>,
    pub correlation_id: Option<String>,
}

impl WireProperties {
    /// Fills `timestamp` and `correlationId` into `payload` where they are
    /// absent, null or blank.
    fn fill(&self, payload: &mut Value) {
        let Value::Object(obj) = payload else {
            return;
        };

        if let Some(ms) = self.timestamp {
            if obj.get("timestamp").map_or(true, Value::is_null) {
                obj.insert("timestamp".to_owned(), Value::from(ms));
            }
        }

        if let Some(id) = self.correlation_id.as_deref().filter(|id| !id.trim().is_empty()) {
            let missing = match obj.get("correlationId") {
                None | Some(Value::Null) => true,
                Some(Value::String(current)) => current.trim().is_empty(),
                Some(_) => false,
            };
            if missing {
                obj.insert("correlationId".to_owned(), Value::from(id));
            }
        }
    }
}

/// A log record or structured event with its delivery context.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub service: String,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub body: EventBody,
    pub metadata: Map<String, Value>,
    pub http_request: Option<HttpSnapshot>,
}

impl Envelope {
    /// New envelope stamped with the current time and a fresh correlation id.
    pub fn new(service: &str, body: EventBody) -> Self {
        Envelope {
            service: service.to_owned(),
            correlation_id: new_correlation_id(),
            timestamp: Utc::now(),
            body,
            metadata: Map::new(),
            http_request: None,
        }
    }

    pub fn log(service: &str, level: LogLevel, message: &str) -> Self {
        Self::new(
            service,
            EventBody::Log {
                level,
                message: message.to_owned(),
            },
        )
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = correlation_id.to_owned();
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_owned(), value.into());
        self
    }

    pub fn with_http_request(mut self, snapshot: HttpSnapshot) -> Self {
        self.http_request = Some(snapshot);
        self
    }

    pub fn category(&self) -> &'static str {
        self.body.category()
    }

    /// Checks required fields and enumerated ranges.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.service.trim().is_empty() {
            return Err(EnvelopeError::MissingField("service"));
        }

        match &self.body {
            EventBody::Log { message, .. } | EventBody::Error { message, .. }
                if message.trim().is_empty() =>
            {
                return Err(EnvelopeError::MissingField("message"));
            }
            _ => {}
        }

        if let Some(code) = self.body.status_code() {
            if !(100..=599).contains(&code) {
                return Err(EnvelopeError::InvalidField {
                    field: "statusCode",
                    value: code.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Fills a missing service name with `default_service` and a missing
    /// correlation id from the request headers, or a freshly generated one.
    pub fn enrich(mut self, default_service: &str) -> Self {
        if self.service.trim().is_empty() {
            self.service = default_service.to_owned();
        }

        if self.correlation_id.trim().is_empty() {
            self.correlation_id = self
                .http_request
                .as_ref()
                .and_then(|req| {
                    CORRELATION_HEADERS
                        .iter()
                        .find_map(|name| req.header(name))
                        .filter(|id| !id.trim().is_empty())
                        .map(str::to_owned)
                })
                .unwrap_or_else(new_correlation_id);
        }

        self
    }

    /// Maps loosely-typed inbound JSON into the canonical shape.
    ///
    /// The body variant comes from `eventType`, then `level`, then `hint`,
    /// falling back to an info log record. Response events default to status
    /// 200 and error events to 500. A missing timestamp becomes the current
    /// time; service and correlation id are left empty when absent, for
    /// [`Envelope::enrich`] to fill.
    pub fn normalize(raw: Value, hint: Option<EventType>) -> Result<Envelope, EnvelopeError> {
        let Value::Object(mut obj) = raw else {
            return Err(EnvelopeError::Malformed("expected a JSON object".to_owned()));
        };

        let message = take_string(&mut obj, "message");
        let status_code = take_status(&mut obj)?;

        let event_type = match take_string(&mut obj, "eventType") {
            Some(value) => Some(value.parse::<EventType>()?),
            None => None,
        };
        let level = match take_string(&mut obj, "level") {
            Some(value) => Some(value.parse::<LogLevel>()?),
            None => None,
        };

        let body = match (event_type, level) {
            (Some(t), _) => event_body(t, message, status_code, &mut obj),
            (None, Some(level)) => EventBody::Log {
                level,
                message: message.unwrap_or_default(),
            },
            (None, None) => match hint {
                Some(t) => event_body(t, message, status_code, &mut obj),
                None => EventBody::Log {
                    level: LogLevel::Info,
                    message: message.unwrap_or_default(),
                },
            },
        };

        let timestamp = match obj.remove("timestamp") {
            None | Some(Value::Null) => Utc::now(),
            Some(value) => parse_timestamp(&value)?,
        };

        let service = take_string(&mut obj, "service")
            .or_else(|| take_string(&mut obj, "serviceId"))
            .unwrap_or_default();
        let correlation_id = take_string(&mut obj, "correlationId").unwrap_or_default();

        let metadata = match obj.remove("metadata") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(EnvelopeError::InvalidField {
                    field: "metadata",
                    value: other.to_string(),
                })
            }
        };

        let http_request = obj.remove("httpRequest").and_then(HttpSnapshot::from_value);

        Ok(Envelope {
            service,
            correlation_id,
            timestamp,
            body,
            metadata,
            http_request,
        })
    }

    /// Decodes a delivered body: UTF-8, then JSON, then [`Envelope::normalize`]
    /// and [`Envelope::enrich`].
    ///
    /// A timestamp or correlation id missing from the body is taken from
    /// `properties` before anything is generated. The returned payload is the
    /// body as parsed.
    pub fn decode(
        data: &[u8],
        hint: Option<EventType>,
        properties: &WireProperties,
    ) -> Result<(Envelope, Value), EnvelopeError> {
        let text =
            std::str::from_utf8(data).map_err(|err| EnvelopeError::Malformed(err.to_string()))?;
        let payload: Value =
            serde_json::from_str(text).map_err(|err| EnvelopeError::Malformed(err.to_string()))?;

        let mut raw = payload.clone();
        properties.fill(&mut raw);

        let envelope = Envelope::normalize(raw, hint)?.enrich(DEFAULT_SERVICE);
        Ok((envelope, payload))
    }
}

fn event_body(
    event_type: EventType,
    message: Option<String>,
    status_code: Option<u16>,
    obj: &mut Map<String, Value>,
) -> EventBody {
    match event_type {
        EventType::Request => EventBody::Request { message },
        EventType::Response => EventBody::Response {
            status_code: status_code.unwrap_or(200),
            response_time_ms: obj.remove("responseTime").and_then(|v| v.as_u64()),
            message,
        },
        EventType::Error => EventBody::Error {
            message: message
                .or_else(|| take_string(obj, "error"))
                .unwrap_or_default(),
            status_code: status_code.unwrap_or(500),
            stack: take_string(obj, "stack"),
        },
        EventType::Info => EventBody::Info {
            message: message.unwrap_or_default(),
        },
        EventType::Warning => EventBody::Warning {
            message: message.unwrap_or_default(),
        },
        EventType::Debug => EventBody::Debug {
            message: message.unwrap_or_default(),
        },
    }
}

fn take_string(obj: &mut Map<String, Value>, key: &str) -> Option<String> {
    match obj.remove(key) {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn take_status(obj: &mut Map<String, Value>) -> Result<Option<u16>, EnvelopeError> {
    match obj.remove("statusCode") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            .and_then(|code| u16::try_from(code).ok())
            .map(Some)
            .ok_or_else(|| EnvelopeError::InvalidField {
                field: "statusCode",
                value: value.to_string(),
            }),
    }
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, EnvelopeError> {
    let parsed = match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    };

    parsed.ok_or_else(|| EnvelopeError::InvalidField {
        field: "timestamp",
        value: value.to_string(),
    })
}

/// Random lowercase alphanumeric token.
pub fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

/// `corr-{epochMillis}-{token}`
pub fn new_correlation_id() -> String {
    format!("corr-{}-{}", Utc::now().timestamp_millis(), random_token())
}

/// `{epochMillis}-{token}`
pub fn new_message_id() -> String {
    format!("{}-{}", Utc::now().timestamp_millis(), random_token())
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;

        map.serialize_entry("service", &self.service)?;
        map.serialize_entry("correlationId", &self.correlation_id)?;
        map.serialize_entry(
            "timestamp",
            &self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        )?;

        match &self.body {
            EventBody::Log { level, message } => {
                map.serialize_entry("level", level.as_str())?;
                map.serialize_entry("message", message)?;
            }
            body => {
                map.serialize_entry("eventType", body.category())?;
                if let Some(message) = body.message() {
                    map.serialize_entry("message", message)?;
                }
                if let Some(code) = body.status_code() {
                    map.serialize_entry("statusCode", &code)?;
                }
                match body {
                    EventBody::Response {
                        response_time_ms: Some(ms),
                        ..
                    } => map.serialize_entry("responseTime", ms)?,
                    EventBody::Error {
                        stack: Some(stack), ..
                    } => map.serialize_entry("stack", stack)?,
                    _ => {}
                }
            }
        }

        if !self.metadata.is_empty() {
            map.serialize_entry("metadata", &self.metadata)?;
        }
        if let Some(snapshot) = &self.http_request {
            map.serialize_entry("httpRequest", snapshot)?;
        }

        map.end()
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Envelope::normalize(raw, None)
            .map(|envelope| envelope.enrich(DEFAULT_SERVICE))
            .map_err(de::Error::custom)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}: {}",
            self.correlation_id,
            self.service,
            self.category(),
            self.body.message().unwrap_or_default()
        )
    }
}
