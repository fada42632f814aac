use crate::common::data::Error::{
    HeaderConversionError, InvalidExpectation, InvalidTimes, RequestConversionError,
    UnknownClearType, UnknownFormat, UnknownRetrieveType,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::{
    de::{self, MapAccess, SeqAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};
use serde_json::Value;
use std::{
    convert::TryFrom,
    fmt,
    str::FromStr,
    time::Duration,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("cannot convert header: {0}")]
    HeaderConversionError(String),
    #[error("cannot convert request to/from internal structure: {0}")]
    RequestConversionError(String),
    #[error("invalid times: {0}")]
    InvalidTimes(String),
    #[error("invalid expectation: {0}")]
    InvalidExpectation(String),
    #[error("\"{0}\" is not a valid value for \"type\" parameter, only the following values are supported [REQUESTS, REQUEST_RESPONSES, RECORDED_EXPECTATIONS, ACTIVE_EXPECTATIONS, LOGS]")]
    UnknownRetrieveType(String),
    #[error("\"{0}\" is not a valid value for \"type\" parameter, only the following values are supported [ALL, LOG, EXPECTATIONS]")]
    UnknownClearType(String),
    #[error("\"{0}\" is not a valid value for \"format\" parameter, only the following values are supported [JSON]")]
    UnknownFormat(String),
}

// ===============================================================================================
// Multi-valued maps (headers, query string parameters)
// ===============================================================================================

/// An insertion-ordered map from a name to one or more values.
///
/// Serialized as `{ "name" : [ "value", ... ] }`. The legacy array form
/// `[ { "name" : "...", "values" : [ ... ] } ]` is accepted on input.
#[derive(Debug, Clone, Default)]
pub struct KeyToMultiValue {
    entries: Vec<(String, Vec<String>)>,
}

impl KeyToMultiValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((name, vec![value])),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    pub fn get_ignore_case(&self, name: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.entries.iter().map(|(n, v)| (n, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for KeyToMultiValue {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut result = KeyToMultiValue::new();
        for (name, value) in iter {
            result.add(name, value);
        }
        result
    }
}

/// Key order and value order within a key are irrelevant for equality.
impl PartialEq for KeyToMultiValue {
    fn eq(&self, other: &Self) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }

        self.entries.iter().all(|(name, values)| match other.get(name) {
            None => false,
            Some(other_values) => {
                let mut left = values.clone();
                let mut right = other_values.to_vec();
                left.sort();
                right.sort();
                left == right
            }
        })
    }
}

impl Serialize for KeyToMultiValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, values) in &self.entries {
            map.serialize_entry(name, values)?;
        }
        map.end()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrManyValues {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
struct NameValues {
    name: String,
    #[serde(default)]
    values: Vec<String>,
}

impl<'de> Deserialize<'de> for KeyToMultiValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeyToMultiValueVisitor;

        impl<'de> Visitor<'de> for KeyToMultiValueVisitor {
            type Value = KeyToMultiValue;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object of names to values or an array of name/values objects")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut result = KeyToMultiValue::new();
                while let Some((name, values)) = access.next_entry::<String, OneOrManyValues>()? {
                    match values {
                        OneOrManyValues::One(value) => result.add(name, value),
                        OneOrManyValues::Many(values) => {
                            for value in values {
                                result.add(name.clone(), value);
                            }
                        }
                    }
                }
                Ok(result)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut result = KeyToMultiValue::new();
                while let Some(entry) = access.next_element::<NameValues>()? {
                    for value in entry.values {
                        result.add(entry.name.clone(), value);
                    }
                }
                Ok(result)
            }
        }

        deserializer.deserialize_any(KeyToMultiValueVisitor)
    }
}

// ===============================================================================================
// Body
// ===============================================================================================

/// A typed request or response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    String(String),
    Json(Value),
    Binary(Bytes),
}

impl Body {
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Body::String(s) => Bytes::from(s.clone()),
            Body::Json(v) => Bytes::from(v.to_string()),
            Body::Binary(b) => b.clone(),
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            Body::String(s) => s.clone(),
            Body::Json(v) => v.to_string(),
            Body::Binary(b) => String::from_utf8_lossy(b).to_string(),
        }
    }

    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            Body::String(_) => None,
            Body::Json(_) => Some("application/json; charset=utf-8"),
            Body::Binary(_) => Some("application/octet-stream"),
        }
    }

    /// Classifies raw bytes received on the wire.
    pub fn from_wire(bytes: Bytes) -> Option<Body> {
        if bytes.is_empty() {
            return None;
        }

        match String::from_utf8(bytes.to_vec()) {
            Ok(s) => Some(Body::String(s)),
            Err(_) => Some(Body::Binary(bytes)),
        }
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Body::String(value.to_string())
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::String(value)
    }
}

impl Serialize for Body {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Body::String(s) => serializer.serialize_str(s),
            Body::Json(v) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "JSON")?;
                map.serialize_entry("json", v)?;
                map.end()
            }
            Body::Binary(b) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "BINARY")?;
                map.serialize_entry("base64Bytes", &BASE64.encode(b))?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Body {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => Ok(Body::String(s)),
            Value::Object(mut object) => {
                let body_type = object
                    .get("type")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                match body_type.as_deref() {
                    Some("STRING") => match object.remove("string") {
                        Some(Value::String(s)) => Ok(Body::String(s)),
                        _ => Err(de::Error::custom("STRING body requires a \"string\" field")),
                    },
                    Some("JSON") => match object.remove("json") {
                        Some(Value::String(s)) => serde_json::from_str(&s)
                            .map(Body::Json)
                            .map_err(de::Error::custom),
                        Some(json) => Ok(Body::Json(json)),
                        None => Err(de::Error::custom("JSON body requires a \"json\" field")),
                    },
                    Some("BINARY") => match object.remove("base64Bytes") {
                        Some(Value::String(encoded)) => BASE64
                            .decode(encoded.as_bytes())
                            .map(|b| Body::Binary(Bytes::from(b)))
                            .map_err(de::Error::custom),
                        _ => Err(de::Error::custom(
                            "BINARY body requires a \"base64Bytes\" field",
                        )),
                    },
                    Some(other) => Err(de::Error::custom(format!(
                        "unsupported body type \"{}\"",
                        other
                    ))),
                    None => Ok(Body::Json(Value::Object(object))),
                }
            }
            other => Ok(Body::Json(other)),
        }
    }
}

// ===============================================================================================
// Request / Response
// ===============================================================================================

/// An HTTP request. Used both for concrete received requests and as a matcher, where every
/// field that is not set means "don't care".
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "KeyToMultiValue::is_empty")]
    pub query_string_parameters: KeyToMultiValue,
    #[serde(default, skip_serializing_if = "KeyToMultiValue::is_empty")]
    pub headers: KeyToMultiValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
}

impl HttpRequest {
    pub fn request() -> Self {
        Self::default()
    }

    pub fn with_method<T: Into<String>>(mut self, method: T) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_path<T: Into<String>>(mut self, path: T) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_query_string_parameter<N: Into<String>, V: Into<String>>(
        mut self,
        name: N,
        value: V,
    ) -> Self {
        self.query_string_parameters.add(name, value);
        self
    }

    pub fn with_header<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_body<T: Into<Body>>(mut self, body: T) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn first_query_string_parameter(&self, name: &str) -> Option<&str> {
        self.query_string_parameters
            .get(name)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    pub fn first_header(&self, name: &str) -> Option<&str> {
        self.headers
            .get_ignore_case(name)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    pub fn body_bytes(&self) -> Bytes {
        self.body.as_ref().map_or(Bytes::new(), Body::to_bytes)
    }

    pub fn path_str(&self) -> &str {
        self.path.as_deref().unwrap_or("")
    }

    pub fn method_str(&self) -> &str {
        self.method.as_deref().unwrap_or("GET")
    }
}

impl TryFrom<&http::Request<Bytes>> for HttpRequest {
    type Error = Error;

    fn try_from(value: &http::Request<Bytes>) -> Result<Self, Self::Error> {
        let mut headers = KeyToMultiValue::new();
        for (name, header_value) in value.headers() {
            let header_value = header_value
                .to_str()
                .map_err(|err| HeaderConversionError(err.to_string()))?;
            headers.add(name.as_str(), header_value);
        }

        // The url crate cannot parse a bare query string, hence the dummy base.
        let url = format!("http://dummy?{}", value.uri().query().unwrap_or(""));
        let url = url::Url::parse(&url).map_err(|err| RequestConversionError(err.to_string()))?;
        let query_string_parameters = url
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Ok(HttpRequest {
            method: Some(value.method().to_string()),
            path: Some(value.uri().path().to_string()),
            query_string_parameters,
            headers,
            body: Body::from_wire(value.body().clone()),
        })
    }
}

/// Time units used by delays and time-to-live values.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    pub fn to_duration(&self, value: u64) -> Duration {
        match self {
            TimeUnit::Nanoseconds => Duration::from_nanos(value),
            TimeUnit::Microseconds => Duration::from_micros(value),
            TimeUnit::Milliseconds => Duration::from_millis(value),
            TimeUnit::Seconds => Duration::from_secs(value),
            TimeUnit::Minutes => Duration::from_secs(value.saturating_mul(60)),
            TimeUnit::Hours => Duration::from_secs(value.saturating_mul(3_600)),
            TimeUnit::Days => Duration::from_secs(value.saturating_mul(86_400)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Delay {
    pub time_unit: TimeUnit,
    pub value: u64,
}

impl Delay {
    pub fn milliseconds(value: u64) -> Self {
        Self {
            time_unit: TimeUnit::Milliseconds,
            value,
        }
    }

    pub fn to_duration(&self) -> Duration {
        self.time_unit.to_duration(self.value)
    }
}

/// An HTTP response, either returned by an expectation or produced by the control plane.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_phrase: Option<String>,
    #[serde(default, skip_serializing_if = "KeyToMultiValue::is_empty")]
    pub headers: KeyToMultiValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<Delay>,
}

impl HttpResponse {
    /// A `200 OK` response without a body.
    pub fn response() -> Self {
        Self::default().with_status_code(200)
    }

    pub fn not_found() -> Self {
        Self::default().with_status_code(404)
    }

    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self.reason_phrase = http::StatusCode::from_u16(status_code)
            .ok()
            .and_then(|s| s.canonical_reason())
            .map(str::to_string);
        self
    }

    pub fn with_header<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_body<T: Into<Body>>(mut self, body: T) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_delay(mut self, delay: Delay) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn status(&self) -> u16 {
        self.status_code.unwrap_or(200)
    }

    pub fn body_as_string(&self) -> String {
        self.body.as_ref().map_or(String::new(), Body::as_string)
    }

    pub fn first_header(&self, name: &str) -> Option<&str> {
        self.headers
            .get_ignore_case(name)
            .and_then(|v| v.first())
            .map(String::as_str)
    }
}

impl TryFrom<&http::Response<Bytes>> for HttpResponse {
    type Error = Error;

    fn try_from(value: &http::Response<Bytes>) -> Result<Self, Self::Error> {
        let mut headers = KeyToMultiValue::new();
        for (name, header_value) in value.headers() {
            let header_value = header_value
                .to_str()
                .map_err(|err| HeaderConversionError(err.to_string()))?;
            headers.add(name.as_str(), header_value);
        }

        Ok(HttpResponse {
            status_code: Some(value.status().as_u16()),
            reason_phrase: value.status().canonical_reason().map(str::to_string),
            headers,
            body: Body::from_wire(value.body().clone()),
            delay: None,
        })
    }
}

impl TryFrom<&HttpResponse> for http::Response<Bytes> {
    type Error = http::Error;

    fn try_from(value: &HttpResponse) -> Result<Self, Self::Error> {
        let mut builder = http::Response::builder().status(value.status());

        for (name, values) in value.headers.iter() {
            for v in values {
                builder = builder.header(name.as_str(), v.as_str());
            }
        }

        if let Some(body) = &value.body {
            if value.first_header("content-type").is_none() {
                if let Some(content_type) = body.content_type() {
                    builder = builder.header(http::header::CONTENT_TYPE, content_type);
                }
            }
        }

        builder.body(value.body.as_ref().map_or(Bytes::new(), Body::to_bytes))
    }
}

// ===============================================================================================
// Actions
// ===============================================================================================

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Forwards the matched request to another host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpForward {
    pub host: String,
    #[serde(default = "default_forward_port")]
    pub port: u16,
    #[serde(default)]
    pub scheme: Scheme,
}

fn default_forward_port() -> u16 {
    80
}

impl HttpForward {
    pub fn forward<T: Into<String>>(host: T, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            scheme: Scheme::Http,
        }
    }

    /// `scheme://host:port`
    pub fn target(&self) -> String {
        format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// What happens when an expectation matches.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Response(HttpResponse),
    Forward(HttpForward),
}

// ===============================================================================================
// Times / TimeToLive
// ===============================================================================================

/// How many more times an expectation may match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "TimesDto", into = "TimesDto")]
pub enum Times {
    #[default]
    Unlimited,
    Remaining(u32),
}

impl Times {
    pub fn once() -> Self {
        Times::Remaining(1)
    }

    pub fn exactly(count: u32) -> Self {
        Times::Remaining(count)
    }

    pub fn has_remaining(&self) -> bool {
        match self {
            Times::Unlimited => true,
            Times::Remaining(n) => *n > 0,
        }
    }

    /// Consumes one invocation. Saturates at zero.
    pub fn decrement(&mut self) {
        if let Times::Remaining(n) = self {
            *n = n.saturating_sub(1);
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimesDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remaining_times: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unlimited: Option<bool>,
}

impl TryFrom<TimesDto> for Times {
    type Error = Error;

    fn try_from(value: TimesDto) -> Result<Self, Self::Error> {
        if value.unlimited == Some(true) {
            return Ok(Times::Unlimited);
        }

        match value.remaining_times {
            None => Ok(Times::Unlimited),
            Some(n) if n < 0 => Err(InvalidTimes(format!(
                "remainingTimes must not be negative but was {}",
                n
            ))),
            Some(n) => u32::try_from(n)
                .map(Times::Remaining)
                .map_err(|_| InvalidTimes(format!("remainingTimes {} is too large", n))),
        }
    }
}

impl From<Times> for TimesDto {
    fn from(value: Times) -> Self {
        match value {
            Times::Unlimited => TimesDto {
                remaining_times: None,
                unlimited: Some(true),
            },
            Times::Remaining(n) => TimesDto {
                remaining_times: Some(n as i64),
                unlimited: None,
            },
        }
    }
}

/// How long an expectation stays eligible for matching.
///
/// A limited time to live is anchored to an absolute `end_date` (epoch milliseconds) when the
/// expectation is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "TimeToLiveDto", into = "TimeToLiveDto")]
pub enum TimeToLive {
    #[default]
    Unlimited,
    Limited {
        time_unit: TimeUnit,
        time_to_live: u64,
        end_date: Option<i64>,
    },
}

impl TimeToLive {
    pub fn exactly(time_unit: TimeUnit, time_to_live: u64) -> Self {
        TimeToLive::Limited {
            time_unit,
            time_to_live,
            end_date: None,
        }
    }

    /// Fixes the expiry instant relative to `now` unless one is already set.
    pub fn anchored_at(self, now: DateTime<Utc>) -> Self {
        match self {
            TimeToLive::Limited {
                time_unit,
                time_to_live,
                end_date: None,
            } => {
                let end = ChronoDuration::from_std(time_unit.to_duration(time_to_live))
                    .ok()
                    .and_then(|duration| now.checked_add_signed(duration))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                TimeToLive::Limited {
                    time_unit,
                    time_to_live,
                    end_date: Some(end.timestamp_millis()),
                }
            }
            other => other,
        }
    }

    pub fn still_alive(&self, now: DateTime<Utc>) -> bool {
        match self {
            TimeToLive::Unlimited => true,
            TimeToLive::Limited { end_date: None, .. } => true,
            TimeToLive::Limited {
                end_date: Some(end),
                ..
            } => match Utc.timestamp_millis_opt(*end).single() {
                Some(end) => now < end,
                None => false,
            },
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeToLiveDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time_unit: Option<TimeUnit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time_to_live: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unlimited: Option<bool>,
}

impl From<TimeToLiveDto> for TimeToLive {
    fn from(value: TimeToLiveDto) -> Self {
        match (value.unlimited, value.time_unit, value.time_to_live) {
            (Some(true), _, _) | (_, None, _) | (_, _, None) => TimeToLive::Unlimited,
            (_, Some(time_unit), Some(time_to_live)) => TimeToLive::Limited {
                time_unit,
                time_to_live,
                end_date: value.end_date,
            },
        }
    }
}

impl From<TimeToLive> for TimeToLiveDto {
    fn from(value: TimeToLive) -> Self {
        match value {
            TimeToLive::Unlimited => TimeToLiveDto {
                time_unit: None,
                time_to_live: None,
                end_date: None,
                unlimited: Some(true),
            },
            TimeToLive::Limited {
                time_unit,
                time_to_live,
                end_date,
            } => TimeToLiveDto {
                time_unit: Some(time_unit),
                time_to_live: Some(time_to_live),
                end_date,
                unlimited: None,
            },
        }
    }
}

// ===============================================================================================
// Expectation
// ===============================================================================================

/// A standing rule: when a request matches `http_request`, perform `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ExpectationDto", into = "ExpectationDto")]
pub struct Expectation {
    pub id: Option<String>,
    pub priority: i32,
    pub http_request: HttpRequest,
    pub action: Option<Action>,
    pub times: Times,
    pub time_to_live: TimeToLive,
}

impl Expectation {
    pub fn new(http_request: HttpRequest) -> Self {
        Self {
            id: None,
            priority: 0,
            http_request,
            action: None,
            times: Times::Unlimited,
            time_to_live: TimeToLive::Unlimited,
        }
    }

    pub fn with_id<T: Into<String>>(mut self, id: T) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_times(mut self, times: Times) -> Self {
        self.times = times;
        self
    }

    pub fn with_time_to_live(mut self, time_to_live: TimeToLive) -> Self {
        self.time_to_live = time_to_live;
        self
    }

    pub fn then_respond(mut self, response: HttpResponse) -> Self {
        self.action = Some(Action::Response(response));
        self
    }

    pub fn then_forward(mut self, forward: HttpForward) -> Self {
        self.action = Some(Action::Forward(forward));
        self
    }

    /// Active expectations take part in matching; inert ones are only listed.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.times.has_remaining() && self.time_to_live.still_alive(now)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExpectationDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    http_request: HttpRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    http_response: Option<HttpResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    http_forward: Option<HttpForward>,
    #[serde(default)]
    times: Times,
    #[serde(default)]
    time_to_live: TimeToLive,
}

impl TryFrom<ExpectationDto> for Expectation {
    type Error = Error;

    fn try_from(value: ExpectationDto) -> Result<Self, Self::Error> {
        let action = match (value.http_response, value.http_forward) {
            (Some(_), Some(_)) => {
                return Err(InvalidExpectation(
                    "only one of httpResponse or httpForward may be specified".to_string(),
                ))
            }
            (Some(response), None) => Some(Action::Response(response)),
            (None, Some(forward)) => Some(Action::Forward(forward)),
            (None, None) => None,
        };

        if let Some(id) = &value.id {
            if id.trim().is_empty() {
                return Err(InvalidExpectation("id must not be blank".to_string()));
            }
        }

        if let Some(Action::Response(HttpResponse {
            status_code: Some(status_code),
            ..
        })) = &action
        {
            if http::StatusCode::from_u16(*status_code).is_err() {
                return Err(InvalidExpectation(format!(
                    "statusCode {} is not a valid HTTP status code",
                    status_code
                )));
            }
        }

        Ok(Expectation {
            id: value.id,
            priority: value.priority,
            http_request: value.http_request,
            action,
            times: value.times,
            time_to_live: value.time_to_live,
        })
    }
}

impl From<Expectation> for ExpectationDto {
    fn from(value: Expectation) -> Self {
        let (http_response, http_forward) = match value.action {
            Some(Action::Response(response)) => (Some(response), None),
            Some(Action::Forward(forward)) => (None, Some(forward)),
            None => (None, None),
        };

        ExpectationDto {
            id: value.id,
            priority: value.priority,
            http_request: value.http_request,
            http_response,
            http_forward,
            times: value.times,
            time_to_live: value.time_to_live,
        }
    }
}

// ===============================================================================================
// Control plane payloads
// ===============================================================================================

/// The ports the server listens on.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct PortBinding {
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl PortBinding {
    pub fn new(ports: Vec<u16>) -> Self {
        Self { ports }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestAndHttpResponse {
    pub http_request: HttpRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_response: Option<HttpResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrieveType {
    Requests,
    RequestResponses,
    RecordedExpectations,
    ActiveExpectations,
    Logs,
}

impl FromStr for RetrieveType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "REQUESTS" => Ok(RetrieveType::Requests),
            "REQUEST_RESPONSES" => Ok(RetrieveType::RequestResponses),
            "RECORDED_EXPECTATIONS" => Ok(RetrieveType::RecordedExpectations),
            "ACTIVE_EXPECTATIONS" => Ok(RetrieveType::ActiveExpectations),
            "LOGS" => Ok(RetrieveType::Logs),
            _ => Err(UnknownRetrieveType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearType {
    All,
    Log,
    Expectations,
}

impl FromStr for ClearType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ALL" => Ok(ClearType::All),
            "LOG" => Ok(ClearType::Log),
            "EXPECTATIONS" => Ok(ClearType::Expectations),
            _ => Err(UnknownClearType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "JSON" => Ok(Format::Json),
            _ => Err(UnknownFormat(s.to_string())),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::common::data::{
        Body, ClearType, Expectation, HttpRequest, KeyToMultiValue, RetrieveType, TimeToLive,
        TimeUnit, Times,
    };
    use chrono::{Duration, TimeZone, Utc};

    /// Equality of multi-valued maps must not depend on key or value order.
    #[test]
    fn key_to_multi_value_equality_ignores_order() {
        // Arrange
        let left: KeyToMultiValue = vec![("a", "1"), ("a", "2"), ("b", "3")]
            .into_iter()
            .collect();
        let right: KeyToMultiValue = vec![("b", "3"), ("a", "2"), ("a", "1")]
            .into_iter()
            .collect();
        let different: KeyToMultiValue = vec![("a", "1"), ("b", "3")].into_iter().collect();

        // Assert
        assert_eq!(left, right);
        assert_ne!(left, different);
    }

    #[test]
    fn key_to_multi_value_accepts_legacy_array_form() {
        // Arrange
        let json = r#"[ { "name" : "Accept", "values" : [ "a", "b" ] } ]"#;

        // Act
        let actual: KeyToMultiValue = serde_json::from_str(json).unwrap();

        // Assert
        assert_eq!(
            actual.get("Accept").unwrap(),
            &["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn key_to_multi_value_accepts_single_string_value() {
        let actual: KeyToMultiValue = serde_json::from_str(r#"{ "x" : "1" }"#).unwrap();
        assert_eq!(actual.get("x").unwrap(), &["1".to_string()]);
    }

    #[test]
    fn body_deserializes_all_kinds() {
        // Arrange
        let string: Body = serde_json::from_str(r#""plain""#).unwrap();
        let typed_string: Body =
            serde_json::from_str(r#"{ "type" : "STRING", "string" : "typed" }"#).unwrap();
        let json: Body =
            serde_json::from_str(r#"{ "type" : "JSON", "json" : { "a" : 1 } }"#).unwrap();
        let binary: Body =
            serde_json::from_str(r#"{ "type" : "BINARY", "base64Bytes" : "AAEC" }"#).unwrap();
        let untyped_object: Body = serde_json::from_str(r#"{ "a" : 1 }"#).unwrap();

        // Assert
        assert_eq!(string, Body::String("plain".to_string()));
        assert_eq!(typed_string, Body::String("typed".to_string()));
        assert_eq!(json, Body::Json(serde_json::json!({ "a": 1 })));
        assert_eq!(binary.to_bytes().to_vec(), vec![0u8, 1, 2]);
        assert_eq!(untyped_object, Body::Json(serde_json::json!({ "a": 1 })));
    }

    #[test]
    fn times_decrement_to_inert() {
        // Arrange
        let mut times = Times::exactly(2);

        // Act
        times.decrement();
        let after_first = times.has_remaining();
        times.decrement();
        times.decrement();

        // Assert
        assert!(after_first);
        assert!(!times.has_remaining());
        assert_eq!(times, Times::Remaining(0));
        assert!(Times::Unlimited.has_remaining());
    }

    #[test]
    fn times_rejects_negative_remaining() {
        let result: Result<Times, _> = serde_json::from_str(r#"{ "remainingTimes" : -1 }"#);
        assert!(result.is_err());
    }

    #[test]
    fn time_to_live_expires_after_end_date() {
        // Arrange
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let ttl = TimeToLive::exactly(TimeUnit::Seconds, 10).anchored_at(now);

        // Assert
        assert!(ttl.still_alive(now));
        assert!(ttl.still_alive(now + Duration::seconds(9)));
        assert!(!ttl.still_alive(now + Duration::seconds(10)));
        assert!(TimeToLive::Unlimited.still_alive(now + Duration::days(1000)));
    }

    #[test]
    fn expectation_rejects_response_and_forward_together() {
        let json = r#"{
            "httpRequest" : { "path" : "/a" },
            "httpResponse" : { "statusCode" : 200 },
            "httpForward" : { "host" : "localhost" }
        }"#;
        let result: Result<Expectation, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn expectation_rejects_out_of_range_status_code() {
        // Arrange
        let json = r#"{
            "httpRequest" : { "path" : "/a" },
            "httpResponse" : { "statusCode" : 1000 }
        }"#;

        // Act
        let result: Result<Expectation, _> = serde_json::from_str(json);

        // Assert
        let err = result.unwrap_err().to_string();
        assert!(err.contains("statusCode 1000"), "{}", err);
    }

    #[test]
    fn expectation_defaults_are_applied() {
        // Act
        let expectation: Expectation =
            serde_json::from_str(r#"{ "httpRequest" : { "path" : "/a" } }"#).unwrap();

        // Assert
        assert_eq!(expectation.id, None);
        assert_eq!(expectation.priority, 0);
        assert_eq!(expectation.times, Times::Unlimited);
        assert_eq!(expectation.time_to_live, TimeToLive::Unlimited);
        assert_eq!(
            expectation.http_request,
            HttpRequest::request().with_path("/a")
        );
    }

    #[test]
    fn parses_query_parameter_enums() {
        assert_eq!(
            "active_expectations".parse::<RetrieveType>().unwrap(),
            RetrieveType::ActiveExpectations
        );
        assert_eq!("LOG".parse::<ClearType>().unwrap(), ClearType::Log);
        assert!("SOMETHING".parse::<RetrieveType>().is_err());
    }
}
