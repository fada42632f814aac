use crate::{
    common::{
        data::{
            ClearType, Expectation, HttpRequest, HttpRequestAndHttpResponse, RetrieveType,
        },
        util::{system_clock, Clock},
    },
    server::{
        config::Configuration,
        expectations::{self, ExpectationStore},
        log::{self, ActivityLog, LogArgument, LogEntry, LogLevel, LogMessageType},
        matchers::{HttpRequestMatcher, RequestMatcher},
    },
};
use std::{collections::HashSet, sync::Arc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    StoreError(#[from] expectations::Error),
    #[error("{0}")]
    LogError(#[from] log::Error),
}

/// The result of a retrieve command, before serialization.
#[derive(Debug, Clone, PartialEq)]
pub enum Retrieved {
    Requests(Vec<HttpRequest>),
    RequestResponses(Vec<HttpRequestAndHttpResponse>),
    Expectations(Vec<Expectation>),
    Logs(String),
}

/// Shared expectation and log state used by the control plane and the action engine.
pub trait StateManager: Send + Sync {
    /// Stores the expectations. Returns the active expectations whose matcher matches the
    /// path of any of the added ones.
    fn add(&self, expectations: Vec<Expectation>) -> Result<Vec<Expectation>, Error>;

    fn first_matching_expectation(
        &self,
        request: &HttpRequest,
    ) -> Result<Option<Expectation>, Error>;

    fn log(&self, entry: LogEntry);

    fn retrieve(
        &self,
        retrieve_type: RetrieveType,
        filter: Option<HttpRequest>,
    ) -> Result<Retrieved, Error>;

    fn clear(&self, clear_type: ClearType, filter: Option<HttpRequest>) -> Result<(), Error>;

    fn reset(&self);
}

pub struct HttpState {
    store: ExpectationStore,
    log: Arc<ActivityLog>,
    clock: Arc<dyn Clock>,
    log_level: LogLevel,
}

impl HttpState {
    pub fn new(config: &Configuration, clock: Arc<dyn Clock>) -> Self {
        Self::with_matcher(config, clock, Arc::new(HttpRequestMatcher))
    }

    pub fn with_matcher(
        config: &Configuration,
        clock: Arc<dyn Clock>,
        matcher: Arc<dyn RequestMatcher>,
    ) -> Self {
        let log = Arc::new(ActivityLog::new(
            clock.clone(),
            matcher.clone(),
            config.max_log_entries,
        ));
        let store = ExpectationStore::new(
            log.clone(),
            matcher,
            clock.clone(),
            config.max_expectations,
        );
        Self {
            store,
            log,
            clock,
            log_level: config.log_level,
        }
    }

    pub fn activity_log(&self) -> &ActivityLog {
        &self.log
    }

    pub fn expectations(&self) -> &ExpectationStore {
        &self.store
    }

    fn audit(&self, message_type: LogMessageType, format: &str, filter: &Option<HttpRequest>) {
        let argument = LogArgument::Request(filter.clone().unwrap_or_default());
        let mut entry = LogEntry::new(message_type).with_message(format, vec![argument]);
        if let Some(filter) = filter {
            entry = entry.with_http_request(filter.clone());
        }
        self.log.append(entry);
    }
}

impl Default for HttpState {
    fn default() -> Self {
        HttpState::new(&Configuration::default(), system_clock())
    }
}

impl StateManager for HttpState {
    fn add(&self, expectations: Vec<Expectation>) -> Result<Vec<Expectation>, Error> {
        let stored: Vec<Expectation> = expectations
            .into_iter()
            .map(|expectation| self.store.add(expectation))
            .collect();

        let now = self.clock.now();
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for expectation in &stored {
            let mut filter = HttpRequest::request();
            filter.path = expectation.http_request.path.clone();

            for active in self.store.retrieve_active(Some(&filter))? {
                if active.is_active(now) && seen.insert(active.id.clone()) {
                    result.push(active);
                }
            }
        }

        Ok(result)
    }

    fn first_matching_expectation(
        &self,
        request: &HttpRequest,
    ) -> Result<Option<Expectation>, Error> {
        Ok(self.store.first_matching(request)?)
    }

    fn log(&self, entry: LogEntry) {
        self.log.append(entry);
    }

    fn retrieve(
        &self,
        retrieve_type: RetrieveType,
        filter: Option<HttpRequest>,
    ) -> Result<Retrieved, Error> {
        tracing::debug!("Retrieving {:?} for filter {:?}", retrieve_type, filter);

        let retrieved = match retrieve_type {
            RetrieveType::Requests => {
                self.audit(
                    LogMessageType::Retrieved,
                    "retrieving requests in json that match:{}",
                    &filter,
                );
                let requests = self
                    .log
                    .retrieve_messages(filter.as_ref(), &[LogMessageType::ReceivedRequest])?
                    .into_iter()
                    .filter_map(|entry| entry.http_request)
                    .collect();
                Retrieved::Requests(requests)
            }
            RetrieveType::RequestResponses => {
                self.audit(
                    LogMessageType::Retrieved,
                    "retrieving requests and responses in json that match:{}",
                    &filter,
                );
                let pairs = self
                    .log
                    .retrieve_messages(
                        filter.as_ref(),
                        &[
                            LogMessageType::ExpectationMatched,
                            LogMessageType::ExpectationNotMatched,
                            LogMessageType::ExpectationResponse,
                            LogMessageType::ForwardedRequest,
                        ],
                    )?
                    .into_iter()
                    .filter_map(|entry| match (entry.http_request, entry.http_response) {
                        (Some(http_request), Some(http_response)) => {
                            Some(HttpRequestAndHttpResponse {
                                http_request,
                                http_response: Some(http_response),
                            })
                        }
                        _ => None,
                    })
                    .collect();
                Retrieved::RequestResponses(pairs)
            }
            RetrieveType::RecordedExpectations => {
                self.audit(
                    LogMessageType::Retrieved,
                    "retrieving recorded expectations in json that match:{}",
                    &filter,
                );
                Retrieved::Expectations(self.store.retrieve_recorded(filter.as_ref())?)
            }
            RetrieveType::ActiveExpectations => {
                self.audit(
                    LogMessageType::Retrieved,
                    "retrieving active expectations in json that match:{}",
                    &filter,
                );
                Retrieved::Expectations(self.store.retrieve_active(filter.as_ref())?)
            }
            RetrieveType::Logs => {
                self.audit(
                    LogMessageType::Retrieved,
                    "retrieving logs that match:{}",
                    &filter,
                );
                Retrieved::Logs(self.log.retrieve_logs(filter.as_ref(), self.log_level)?)
            }
        };

        Ok(retrieved)
    }

    fn clear(&self, clear_type: ClearType, filter: Option<HttpRequest>) -> Result<(), Error> {
        tracing::debug!("Clearing {:?} for filter {:?}", clear_type, filter);

        let format = match clear_type {
            ClearType::All => {
                self.store.clear(filter.as_ref())?;
                "clearing expectations and logs that match:{}"
            }
            ClearType::Log => {
                self.log.clear(filter.as_ref())?;
                "clearing logs that match:{}"
            }
            ClearType::Expectations => {
                self.store.clear_expectations(filter.as_ref())?;
                "clearing expectations that match:{}"
            }
        };

        self.audit(LogMessageType::Cleared, format, &filter);
        Ok(())
    }

    fn reset(&self) {
        self.store.reset();
        tracing::info!("Removed all expectations and log entries");
    }
}

#[cfg(test)]
mod test {
    use crate::{
        common::{
            data::{ClearType, Expectation, HttpRequest, HttpResponse, RetrieveType},
            util::FixedClock,
        },
        server::{
            config::Configuration,
            log::{LogEntry, LogMessageType},
            state::{HttpState, Retrieved, StateManager},
        },
    };
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn state() -> HttpState {
        let clock = FixedClock(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());
        HttpState::new(&Configuration::default(), Arc::new(clock))
    }

    fn path(path: &str) -> HttpRequest {
        HttpRequest::request().with_path(path)
    }

    #[test]
    fn add_returns_active_expectations_for_the_same_path() {
        // Arrange
        let state = state();
        state
            .add(vec![Expectation::new(path("/other")).with_id("other")])
            .unwrap();
        state
            .add(vec![Expectation::new(path("/a")).with_id("first")])
            .unwrap();

        // Act
        let added = state
            .add(vec![Expectation::new(path("/a")).with_id("second")])
            .unwrap();

        // Assert
        let ids: Vec<String> = added.into_iter().filter_map(|e| e.id).collect();
        assert_eq!(ids, vec!["second", "first"]);
    }

    #[test]
    fn retrieves_received_requests() {
        // Arrange
        let state = state();
        state.log(LogEntry::new(LogMessageType::ReceivedRequest).with_http_request(path("request_one")));
        state.log(LogEntry::new(LogMessageType::ReceivedRequest).with_http_request(path("request_two")));

        // Act
        let retrieved = state
            .retrieve(RetrieveType::Requests, Some(path("request_one")))
            .unwrap();

        // Assert
        assert_eq!(retrieved, Retrieved::Requests(vec![path("request_one")]));
    }

    #[test]
    fn retrieves_request_response_pairs() {
        // Arrange
        let state = state();
        state.log(
            LogEntry::new(LogMessageType::ExpectationMatched)
                .with_http_request(path("/a"))
                .with_http_response(HttpResponse::response().with_body("a")),
        );
        state.log(LogEntry::new(LogMessageType::ReceivedRequest).with_http_request(path("/a")));

        // Act
        let retrieved = state.retrieve(RetrieveType::RequestResponses, None).unwrap();

        // Assert
        match retrieved {
            Retrieved::RequestResponses(pairs) => {
                assert_eq!(pairs.len(), 1);
                assert_eq!(pairs[0].http_request, path("/a"));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn clear_by_type_only_touches_the_selected_store() {
        // Arrange
        let state = state();
        state.add(vec![Expectation::new(path("/a"))]).unwrap();
        state.log(LogEntry::new(LogMessageType::ReceivedRequest).with_http_request(path("/a")));

        // Act
        state.clear(ClearType::Log, Some(path("/a"))).unwrap();

        // Assert
        assert_eq!(
            state.retrieve(RetrieveType::Requests, Some(path("/a"))).unwrap(),
            Retrieved::Requests(vec![])
        );
        assert!(state.first_matching_expectation(&path("/a")).unwrap().is_some());

        state.clear(ClearType::Expectations, None).unwrap();
        assert!(state.first_matching_expectation(&path("/a")).unwrap().is_none());
    }

    #[test]
    fn clear_audit_entry_survives_its_own_clear() {
        // Arrange
        let state = state();
        state.add(vec![Expectation::new(path("/a"))]).unwrap();

        // Act
        state.clear(ClearType::All, Some(path("/a"))).unwrap();

        // Assert
        let entries = state
            .activity_log()
            .retrieve_messages(Some(&path("/a")), &[])
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message_type, LogMessageType::Cleared);
    }

    #[test]
    fn reset_removes_everything() {
        let state = state();
        state.add(vec![Expectation::new(path("/a"))]).unwrap();
        state.log(LogEntry::new(LogMessageType::ReceivedRequest).with_http_request(path("/a")));

        state.reset();

        assert!(state.expectations().is_empty());
        assert!(state.activity_log().is_empty());
    }
}
