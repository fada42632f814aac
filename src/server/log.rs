use crate::{
    common::{
        data::{Action, Expectation, HttpForward, HttpRequest, HttpResponse, TimeToLive, Times},
        serialization::{self, indent_lines, serialize_list, to_pretty_json},
        util::{format_log_timestamp, Clock},
    },
    server::matchers::{self, RequestMatcher},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::VecDeque,
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
};
use thiserror::Error;

const SEPARATOR: &str = "------------------------------------\n";

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot filter log entries: {0}")]
    MatcherError(#[from] matchers::Error),
    #[error("cannot render log entry: {0}")]
    RenderError(#[from] serialization::Error),
    #[error("\"{0}\" is not a valid log level, only the following values are supported [TRACE, DEBUG, INFO, WARN, ERROR]")]
    UnknownLogLevel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            _ => Err(Error::UnknownLogLevel(s.to_string())),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogMessageType {
    ReceivedRequest,
    ExpectationMatched,
    ExpectationNotMatched,
    ExpectationResponse,
    ForwardedRequest,
    CreatedExpectation,
    Cleared,
    Retrieved,
    ServerConfiguration,
    Exception,
}

impl LogMessageType {
    pub fn default_level(&self) -> LogLevel {
        match self {
            LogMessageType::Exception => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogMessageType::ReceivedRequest => "RECEIVED_REQUEST",
            LogMessageType::ExpectationMatched => "EXPECTATION_MATCHED",
            LogMessageType::ExpectationNotMatched => "EXPECTATION_NOT_MATCHED",
            LogMessageType::ExpectationResponse => "EXPECTATION_RESPONSE",
            LogMessageType::ForwardedRequest => "FORWARDED_REQUEST",
            LogMessageType::CreatedExpectation => "CREATED_EXPECTATION",
            LogMessageType::Cleared => "CLEARED",
            LogMessageType::Retrieved => "RETRIEVED",
            LogMessageType::ServerConfiguration => "SERVER_CONFIGURATION",
            LogMessageType::Exception => "EXCEPTION",
        }
    }
}

impl fmt::Display for LogMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value substituted into a `{}` placeholder of a log message.
///
/// Structured arguments are pretty printed on their own indented block, text is inlined.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LogArgument {
    Request(HttpRequest),
    Response(HttpResponse),
    Expectation(Expectation),
    Expectations(Vec<Expectation>),
    Text(String),
}

impl LogArgument {
    fn render(&self) -> Result<String, serialization::Error> {
        let json = match self {
            LogArgument::Text(text) => return Ok(text.clone()),
            LogArgument::Expectation(expectation) => {
                to_pretty_json("expectation", &LoggedExpectation::from(expectation))?
            }
            LogArgument::Expectations(expectations) => {
                let logged: Vec<LoggedExpectation> =
                    expectations.iter().map(LoggedExpectation::from).collect();
                serialize_list("expectations", &logged)?
            }
            other => to_pretty_json("log argument", other)?,
        };
        Ok(format!("\n\n{}\n", indent_lines(&json)))
    }
}

/// Expectation layout inside log messages: the action comes after `times` and `timeToLive`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoggedExpectation<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    priority: i32,
    http_request: &'a HttpRequest,
    times: Times,
    time_to_live: TimeToLive,
    #[serde(skip_serializing_if = "Option::is_none")]
    http_response: Option<&'a HttpResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    http_forward: Option<&'a HttpForward>,
}

impl<'a> From<&'a Expectation> for LoggedExpectation<'a> {
    fn from(expectation: &'a Expectation) -> Self {
        let (http_response, http_forward) = match &expectation.action {
            Some(Action::Response(response)) => (Some(response), None),
            Some(Action::Forward(forward)) => (None, Some(forward)),
            None => (None, None),
        };

        LoggedExpectation {
            id: expectation.id.as_deref(),
            priority: expectation.priority,
            http_request: &expectation.http_request,
            times: expectation.times,
            time_to_live: expectation.time_to_live,
            http_response,
            http_forward,
        }
    }
}

/// One immutable event of the activity log. The timestamp is assigned by [`ActivityLog::append`].
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message_type: LogMessageType,
    pub http_request: Option<HttpRequest>,
    pub http_response: Option<HttpResponse>,
    pub expectation: Option<Expectation>,
    pub message_format: Option<String>,
    pub arguments: Vec<LogArgument>,
}

impl LogEntry {
    pub fn new(message_type: LogMessageType) -> Self {
        Self {
            timestamp: DateTime::<Utc>::MIN_UTC,
            level: message_type.default_level(),
            message_type,
            http_request: None,
            http_response: None,
            expectation: None,
            message_format: None,
            arguments: Vec::new(),
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_http_request(mut self, request: HttpRequest) -> Self {
        self.http_request = Some(request);
        self
    }

    pub fn with_http_response(mut self, response: HttpResponse) -> Self {
        self.http_response = Some(response);
        self
    }

    pub fn with_expectation(mut self, expectation: Expectation) -> Self {
        self.expectation = Some(expectation);
        self
    }

    pub fn with_message<T: Into<String>>(mut self, format: T, arguments: Vec<LogArgument>) -> Self {
        self.message_format = Some(format.into());
        self.arguments = arguments;
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The message with every `{}` placeholder replaced by its argument. Entries created
    /// without an explicit message describe themselves from their payload.
    pub fn message(&self) -> Result<String, Error> {
        let (format, arguments) = match &self.message_format {
            Some(format) => (format.clone(), self.arguments.clone()),
            None => self.default_message(),
        };

        let mut arguments = arguments.iter();
        let mut parts = format.split("{}");
        let mut message = parts.next().unwrap_or_default().to_string();
        for part in parts {
            match arguments.next() {
                Some(argument) => message.push_str(&argument.render()?),
                None => message.push_str("{}"),
            }
            message.push_str(part);
        }

        Ok(message)
    }

    /// `<timestamp> - <message>` followed by a newline.
    pub fn render(&self) -> Result<String, Error> {
        Ok(format!(
            "{} - {}\n",
            format_log_timestamp(&self.timestamp),
            self.message()?
        ))
    }

    fn default_message(&self) -> (String, Vec<LogArgument>) {
        let request = self.http_request.clone().map(LogArgument::Request);
        let response = self.http_response.clone().map(LogArgument::Response);
        let expectation = self.expectation.clone().map(LogArgument::Expectation);

        let (format, arguments) = match self.message_type {
            LogMessageType::ReceivedRequest => ("received request:{}", vec![request]),
            LogMessageType::ExpectationMatched => (
                "request:{}matched expectation:{}",
                vec![request, expectation],
            ),
            LogMessageType::ExpectationNotMatched => {
                ("no expectation for request:{}", vec![request])
            }
            LogMessageType::ExpectationResponse => (
                "returning response:{}for request:{}",
                vec![response, request],
            ),
            LogMessageType::ForwardedRequest => (
                "returning response:{}for forwarded request:{}",
                vec![response, request],
            ),
            LogMessageType::CreatedExpectation => ("creating expectation:{}", vec![expectation]),
            LogMessageType::Cleared => ("clearing that match:{}", vec![request]),
            LogMessageType::Retrieved => ("retrieving that match:{}", vec![request]),
            LogMessageType::ServerConfiguration | LogMessageType::Exception => {
                (self.message_type.as_str(), vec![])
            }
        };

        let arguments: Vec<LogArgument> = arguments.into_iter().flatten().collect();
        if arguments.is_empty() {
            return (format.replace("{}", ""), arguments);
        }
        (format.to_string(), arguments)
    }
}

struct LogState {
    entries: VecDeque<LogEntry>,
    last_timestamp: Option<DateTime<Utc>>,
}

/// Append-only store of server events.
///
/// Entries are kept in append order and time stamped on append; timestamps never decrease.
/// Once `max_entries` is exceeded the oldest entries are dropped.
pub struct ActivityLog {
    state: Mutex<LogState>,
    clock: Arc<dyn Clock>,
    matcher: Arc<dyn RequestMatcher>,
    max_entries: usize,
}

impl ActivityLog {
    pub fn new(clock: Arc<dyn Clock>, matcher: Arc<dyn RequestMatcher>, max_entries: usize) -> Self {
        Self {
            state: Mutex::new(LogState {
                entries: VecDeque::new(),
                last_timestamp: None,
            }),
            clock,
            matcher,
            max_entries,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn append(&self, mut entry: LogEntry) {
        let now = self.clock.now();
        let mut state = self.lock();

        let timestamp = match state.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        entry.timestamp = timestamp;
        state.last_timestamp = Some(timestamp);

        tracing::trace!("Appending {} log entry", entry.message_type);
        state.entries.push_back(entry);

        while state.entries.len() > self.max_entries {
            state.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries of the given types whose request matches the filter, in append order.
    /// An empty type list selects every type.
    pub fn retrieve_messages(
        &self,
        filter: Option<&HttpRequest>,
        types: &[LogMessageType],
    ) -> Result<Vec<LogEntry>, Error> {
        let snapshot: Vec<LogEntry> = self.lock().entries.iter().cloned().collect();

        let mut result = Vec::new();
        for entry in snapshot {
            if !types.is_empty() && !types.contains(&entry.message_type) {
                continue;
            }
            if self.entry_matches(filter, &entry)? {
                result.push(entry);
            }
        }

        Ok(result)
    }

    /// Renders all entries at or above `min_level` whose request matches the filter.
    pub fn retrieve_logs(
        &self,
        filter: Option<&HttpRequest>,
        min_level: LogLevel,
    ) -> Result<String, Error> {
        let rendered = self
            .retrieve_messages(filter, &[])?
            .iter()
            .filter(|entry| entry.level >= min_level)
            .map(LogEntry::render)
            .collect::<Result<Vec<String>, Error>>()?;

        Ok(rendered.join(SEPARATOR))
    }

    /// Removes every entry whose request matches the filter, or all entries without a filter.
    pub fn clear(&self, filter: Option<&HttpRequest>) -> Result<(), Error> {
        let filter = match filter {
            Some(filter) => filter,
            None => {
                self.reset();
                return Ok(());
            }
        };

        let mut state = self.lock();
        let mut keep = Vec::with_capacity(state.entries.len());
        for entry in state.entries.iter() {
            keep.push(match &entry.http_request {
                Some(request) => !self.matcher.matches(filter, request)?,
                None => true,
            });
        }

        let mut keep = keep.into_iter();
        state.entries.retain(|_| keep.next().unwrap_or(true));

        Ok(())
    }

    pub fn reset(&self) {
        self.lock().entries.clear();
    }

    fn entry_matches(&self, filter: Option<&HttpRequest>, entry: &LogEntry) -> Result<bool, Error> {
        match (filter, &entry.http_request) {
            (None, _) => Ok(true),
            (Some(_), None) => Ok(false),
            (Some(filter), Some(request)) => Ok(self.matcher.matches(filter, request)?),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{
        common::{
            data::{Expectation, HttpRequest, HttpResponse},
            util::{format_log_timestamp, Clock, FixedClock},
        },
        server::{
            log::{ActivityLog, LogArgument, LogEntry, LogLevel, LogMessageType},
            matchers::HttpRequestMatcher,
        },
    };
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::{Arc, Mutex};

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
    }

    fn log_with_clock(clock: Arc<dyn Clock>, max_entries: usize) -> ActivityLog {
        ActivityLog::new(clock, Arc::new(HttpRequestMatcher), max_entries)
    }

    fn received(path: &str) -> LogEntry {
        LogEntry::new(LogMessageType::ReceivedRequest)
            .with_http_request(HttpRequest::request().with_path(path))
    }

    /// A clock that goes backwards on every call.
    struct RewindingClock(Mutex<DateTime<Utc>>);

    impl Clock for RewindingClock {
        fn now(&self) -> DateTime<Utc> {
            let mut current = self.0.lock().unwrap();
            *current -= Duration::seconds(1);
            *current
        }
    }

    #[test]
    fn renders_entries_with_separator_and_indented_payload() {
        // Arrange
        let log = log_with_clock(Arc::new(FixedClock(fixed_time())), 100);
        let expectation = Expectation::new(HttpRequest::request().with_path("request_one"))
            .with_id("key_one")
            .then_respond(HttpResponse::response().with_body("response_one"));
        let filter = HttpRequest::request().with_path("request_one");
        log.append(
            LogEntry::new(LogMessageType::CreatedExpectation)
                .with_http_request(expectation.http_request.clone())
                .with_message(
                    "creating expectation:{}",
                    vec![LogArgument::Expectation(expectation.clone())],
                ),
        );
        log.append(
            LogEntry::new(LogMessageType::Retrieved)
                .with_http_request(filter.clone())
                .with_message(
                    "retrieving logs that match:{}",
                    vec![LogArgument::Request(filter.clone())],
                ),
        );

        // Act
        let actual = log.retrieve_logs(Some(&filter), LogLevel::Info).unwrap();

        // Assert
        let ts = format_log_timestamp(&fixed_time());
        let expected = format!("{} - creating expectation:\n", ts)
            + "\n"
            + "  {\n"
            + "    \"id\" : \"key_one\",\n"
            + "    \"priority\" : 0,\n"
            + "    \"httpRequest\" : {\n"
            + "      \"path\" : \"request_one\"\n"
            + "    },\n"
            + "    \"times\" : {\n"
            + "      \"unlimited\" : true\n"
            + "    },\n"
            + "    \"timeToLive\" : {\n"
            + "      \"unlimited\" : true\n"
            + "    },\n"
            + "    \"httpResponse\" : {\n"
            + "      \"statusCode\" : 200,\n"
            + "      \"reasonPhrase\" : \"OK\",\n"
            + "      \"body\" : \"response_one\"\n"
            + "    }\n"
            + "  }\n"
            + "\n"
            + "------------------------------------\n"
            + &format!("{} - retrieving logs that match:\n", ts)
            + "\n"
            + "  {\n"
            + "    \"path\" : \"request_one\"\n"
            + "  }\n"
            + "\n";
        assert_eq!(actual, expected);
    }

    #[test]
    fn timestamps_never_decrease() {
        // Arrange
        let log = log_with_clock(Arc::new(RewindingClock(Mutex::new(fixed_time()))), 100);

        // Act
        log.append(received("/a"));
        log.append(received("/b"));
        log.append(received("/c"));

        // Assert
        let entries = log.retrieve_messages(None, &[]).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries
            .windows(2)
            .all(|pair| pair[0].timestamp() <= pair[1].timestamp()));
    }

    #[test]
    fn retrieve_filters_by_request_and_type() {
        // Arrange
        let log = log_with_clock(Arc::new(FixedClock(fixed_time())), 100);
        log.append(received("/a"));
        log.append(received("/b"));
        log.append(
            LogEntry::new(LogMessageType::ExpectationNotMatched)
                .with_http_request(HttpRequest::request().with_path("/a")),
        );
        log.append(LogEntry::new(LogMessageType::ServerConfiguration));

        // Act
        let by_path = log
            .retrieve_messages(Some(&HttpRequest::request().with_path("/a")), &[])
            .unwrap();
        let by_type = log
            .retrieve_messages(None, &[LogMessageType::ReceivedRequest])
            .unwrap();

        // Assert
        assert_eq!(by_path.len(), 2);
        assert_eq!(by_type.len(), 2);
        assert_eq!(log.retrieve_messages(None, &[]).unwrap().len(), 4);
    }

    #[test]
    fn clear_removes_only_matching_entries() {
        // Arrange
        let log = log_with_clock(Arc::new(FixedClock(fixed_time())), 100);
        log.append(received("/a"));
        log.append(received("/b"));
        log.append(LogEntry::new(LogMessageType::ServerConfiguration));

        // Act
        log.clear(Some(&HttpRequest::request().with_path("/a")))
            .unwrap();

        // Assert
        let remaining = log.retrieve_messages(None, &[]).unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(
            remaining[0].http_request,
            Some(HttpRequest::request().with_path("/b"))
        );

        log.clear(None).unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn drops_oldest_entries_beyond_capacity() {
        let log = log_with_clock(Arc::new(FixedClock(fixed_time())), 2);
        log.append(received("/a"));
        log.append(received("/b"));
        log.append(received("/c"));

        let paths: Vec<String> = log
            .retrieve_messages(None, &[])
            .unwrap()
            .into_iter()
            .map(|e| e.http_request.unwrap().path.unwrap())
            .collect();
        assert_eq!(paths, vec!["/b", "/c"]);
    }

    #[test]
    fn filters_by_minimum_level() {
        // Arrange
        let log = log_with_clock(Arc::new(FixedClock(fixed_time())), 100);
        log.append(received("/a").with_level(LogLevel::Debug));
        log.append(
            LogEntry::new(LogMessageType::Exception).with_message("boom", vec![]),
        );

        // Act
        let actual = log.retrieve_logs(None, LogLevel::Warn).unwrap();

        // Assert
        assert_eq!(
            actual,
            format!("{} - boom\n", format_log_timestamp(&fixed_time()))
        );
    }

    #[test]
    fn default_message_describes_payload() {
        let entry = received("/a");
        assert_eq!(
            entry.message().unwrap(),
            "received request:\n\n  {\n    \"path\" : \"/a\"\n  }\n"
        );
        assert_eq!(
            LogEntry::new(LogMessageType::ServerConfiguration)
                .message()
                .unwrap(),
            "SERVER_CONFIGURATION"
        );
    }

    #[test]
    fn parses_log_levels() {
        assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!(LogLevel::Error > LogLevel::Info);
        assert!("LOUD".parse::<LogLevel>().is_err());
    }
}
