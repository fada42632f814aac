use crate::{
    common::{
        data::{Action, Expectation, HttpRequest, HttpResponse, Scheme, Times},
        http::HttpClient,
    },
    server::{
        log::{LogArgument, LogEntry, LogMessageType},
        state::StateManager,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use std::{collections::HashSet, convert::TryFrom, net::SocketAddr, sync::Arc};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot build upstream request: {0}")]
    UpstreamRequestError(#[from] http::Error),
    #[error("cannot forward request: {0}")]
    ForwardError(#[from] crate::common::http::Error),
    #[error("cannot read upstream response: {0}")]
    UpstreamResponseError(#[from] crate::common::data::Error),
}

/// Delivers the response for one data plane request. Consumed on write, so a request is never
/// answered twice.
pub struct ResponseWriter {
    sender: oneshot::Sender<HttpResponse>,
}

impl ResponseWriter {
    pub fn channel() -> (ResponseWriter, oneshot::Receiver<HttpResponse>) {
        let (sender, receiver) = oneshot::channel();
        (ResponseWriter { sender }, receiver)
    }

    pub fn write_response(self, response: HttpResponse) {
        if self.sender.send(response).is_err() {
            tracing::debug!("Client went away before the response was written");
        }
    }
}

/// Turns a data plane request into a response.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// `local_addresses` holds the `Host` header values that address this server itself.
    /// `synchronous` is reserved and currently always `false`.
    async fn process_action(
        &self,
        request: HttpRequest,
        writer: ResponseWriter,
        remote_address: Option<SocketAddr>,
        local_addresses: &HashSet<String>,
        proxying: bool,
        synchronous: bool,
    );
}

/// Default action engine: answer from the first matching expectation; without a match,
/// forward when proxying and the request is not addressed to this server, otherwise 404.
pub struct HttpActionHandler<S>
where
    S: StateManager + 'static,
{
    state: Arc<S>,
    http_client: Arc<dyn HttpClient + Send + Sync + 'static>,
}

impl<S> HttpActionHandler<S>
where
    S: StateManager + 'static,
{
    pub fn new(state: Arc<S>, http_client: Arc<dyn HttpClient + Send + Sync + 'static>) -> Self {
        Self { state, http_client }
    }

    async fn respond(&self, request: &HttpRequest, expectation: Expectation) -> HttpResponse {
        match expectation.action.clone() {
            Some(Action::Forward(forward)) => self.forward(request, &forward.target()).await,
            action => {
                let response = match action {
                    Some(Action::Response(response)) => response,
                    _ => HttpResponse::response(),
                };

                if let Some(delay) = &response.delay {
                    tokio::time::sleep(delay.to_duration()).await;
                }

                self.state.log(
                    LogEntry::new(LogMessageType::ExpectationMatched)
                        .with_http_request(request.clone())
                        .with_http_response(response.clone())
                        .with_expectation(expectation.clone())
                        .with_message(
                            "returning response:{}for request:{}for expectation:{}",
                            vec![
                                LogArgument::Response(response.clone()),
                                LogArgument::Request(request.clone()),
                                LogArgument::Expectation(expectation),
                            ],
                        ),
                );

                response
            }
        }
    }

    async fn forward(&self, request: &HttpRequest, target: &str) -> HttpResponse {
        match self.send_upstream(request, target).await {
            Ok(response) => {
                let recorded = Expectation::new(request.clone())
                    .with_times(Times::once())
                    .then_respond(response.clone());
                self.state.log(
                    LogEntry::new(LogMessageType::ForwardedRequest)
                        .with_http_request(request.clone())
                        .with_http_response(response.clone())
                        .with_expectation(recorded)
                        .with_message(
                            "returning response:{}for forwarded request:{}",
                            vec![
                                LogArgument::Response(response.clone()),
                                LogArgument::Request(request.clone()),
                            ],
                        ),
                );
                response
            }
            Err(err) => {
                tracing::warn!("Failed to forward request to {}: {}", target, err);
                self.state.log(
                    LogEntry::new(LogMessageType::Exception)
                        .with_http_request(request.clone())
                        .with_message(
                            format!("exception forwarding request to {}: {}:{{}}", target, err),
                            vec![LogArgument::Request(request.clone())],
                        ),
                );
                HttpResponse::response()
                    .with_status_code(StatusCode::BAD_GATEWAY.as_u16())
                    .with_body(err.to_string())
            }
        }
    }

    async fn send_upstream(&self, request: &HttpRequest, target: &str) -> Result<HttpResponse, Error> {
        let upstream = to_upstream_request(request, target)?;
        let response = self.http_client.send(upstream).await?;
        Ok(HttpResponse::try_from(&response)?)
    }

    fn not_found(&self, request: &HttpRequest) -> HttpResponse {
        let response = HttpResponse::not_found();
        self.state.log(
            LogEntry::new(LogMessageType::ExpectationNotMatched)
                .with_http_request(request.clone())
                .with_http_response(response.clone())
                .with_message(
                    "no expectation for:{}returning response:{}",
                    vec![
                        LogArgument::Request(request.clone()),
                        LogArgument::Response(response.clone()),
                    ],
                ),
        );
        response
    }
}

#[async_trait]
impl<S> ActionHandler for HttpActionHandler<S>
where
    S: StateManager + 'static,
{
    async fn process_action(
        &self,
        request: HttpRequest,
        writer: ResponseWriter,
        remote_address: Option<SocketAddr>,
        local_addresses: &HashSet<String>,
        proxying: bool,
        _synchronous: bool,
    ) {
        tracing::debug!(
            "Processing {} {} from {:?} (proxying: {})",
            request.method_str(),
            request.path_str(),
            remote_address,
            proxying
        );

        let response = match self.state.first_matching_expectation(&request) {
            Ok(Some(expectation)) => self.respond(&request, expectation).await,
            Ok(None) => match request.first_header("host") {
                Some(host) if proxying && !is_local_address(local_addresses, host) => {
                    let target = format!("{}://{}", Scheme::Http.as_str(), host);
                    self.forward(&request, &target).await
                }
                _ => self.not_found(&request),
            },
            Err(err) => {
                tracing::error!("Failed to match request against expectations: {}", err);
                self.state.log(
                    LogEntry::new(LogMessageType::Exception)
                        .with_http_request(request.clone())
                        .with_message(
                            format!("exception matching request: {}:{{}}", err),
                            vec![LogArgument::Request(request.clone())],
                        ),
                );
                HttpResponse::response()
                    .with_status_code(StatusCode::INTERNAL_SERVER_ERROR.as_u16())
                    .with_body(err.to_string())
            }
        };

        writer.write_response(response);
    }
}

/// Builds the upstream request for `target` (`scheme://authority`).
pub fn to_upstream_request(
    request: &HttpRequest,
    target: &str,
) -> Result<http::Request<Bytes>, http::Error> {
    let mut uri = format!("{}{}", target, request.path_str());
    if !request.query_string_parameters.is_empty() {
        let mut query = form_urlencoded::Serializer::new(String::new());
        for (name, values) in request.query_string_parameters.iter() {
            for value in values {
                query.append_pair(name, value);
            }
        }
        uri.push('?');
        uri.push_str(&query.finish());
    }

    let mut builder = http::Request::builder()
        .method(request.method_str())
        .uri(uri);
    for (name, values) in request.headers.iter() {
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }

    builder.body(request.body_bytes())
}

/// Host names are case-insensitive, so `LOCALHOST:1080` addresses the same server as
/// `localhost:1080`.
fn is_local_address(local_addresses: &HashSet<String>, host: &str) -> bool {
    local_addresses
        .iter()
        .any(|address| address.eq_ignore_ascii_case(host))
}

#[cfg(test)]
mod test {
    use crate::{
        common::{
            data::{Expectation, HttpForward, HttpRequest, HttpResponse, Times},
            http::{Error as HttpClientError, HttpClient},
            util::system_clock,
        },
        server::{
            action::{to_upstream_request, ActionHandler, HttpActionHandler, ResponseWriter},
            config::Configuration,
            log::LogMessageType,
            matchers::{Error as MatcherError, RequestMatcher},
            state::{HttpState, StateManager},
        },
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{Request, Response};
    use std::{
        collections::HashSet,
        sync::{Arc, Mutex},
    };

    /// Answers every request with a fixed body and remembers the request URIs.
    #[derive(Default)]
    struct FakeUpstream {
        uris: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HttpClient for FakeUpstream {
        async fn send(&self, req: Request<Bytes>) -> Result<Response<Bytes>, HttpClientError> {
            self.uris.lock().unwrap().push(req.uri().to_string());
            Ok(Response::builder()
                .status(200)
                .body(Bytes::from_static(b"upstream"))
                .unwrap())
        }
    }

    struct FailingMatcher;

    impl RequestMatcher for FailingMatcher {
        fn matches(&self, _: &HttpRequest, _: &HttpRequest) -> Result<bool, MatcherError> {
            Err(MatcherError::EvaluationError("broken matcher".to_string()))
        }
    }

    fn aliases() -> HashSet<String> {
        ["localhost:1080".to_string()].into_iter().collect()
    }

    async fn process(
        handler: &HttpActionHandler<HttpState>,
        request: HttpRequest,
        proxying: bool,
    ) -> HttpResponse {
        let (writer, receiver) = ResponseWriter::channel();
        handler
            .process_action(request, writer, None, &aliases(), proxying, false)
            .await;
        receiver.await.unwrap()
    }

    fn setup() -> (Arc<HttpState>, Arc<FakeUpstream>, HttpActionHandler<HttpState>) {
        let state = Arc::new(HttpState::default());
        let upstream = Arc::new(FakeUpstream::default());
        let handler = HttpActionHandler::new(state.clone(), upstream.clone());
        (state, upstream, handler)
    }

    #[tokio::test]
    async fn responds_from_matching_expectation() {
        // Arrange
        let (state, _, handler) = setup();
        state
            .add(vec![Expectation::new(HttpRequest::request().with_path("/a"))
                .then_respond(HttpResponse::response().with_body("a"))])
            .unwrap();

        // Act
        let response = process(&handler, HttpRequest::request().with_path("/a"), false).await;

        // Assert
        assert_eq!(response.body_as_string(), "a");
        let matched = state
            .activity_log()
            .retrieve_messages(None, &[LogMessageType::ExpectationMatched])
            .unwrap();
        assert_eq!(matched.len(), 1);
    }

    #[tokio::test]
    async fn answers_404_without_match() {
        let (state, _, handler) = setup();

        let response = process(&handler, HttpRequest::request().with_path("/none"), false).await;

        assert_eq!(response.status(), 404);
        let not_matched = state
            .activity_log()
            .retrieve_messages(None, &[LogMessageType::ExpectationNotMatched])
            .unwrap();
        assert_eq!(not_matched.len(), 1);
    }

    #[tokio::test]
    async fn proxies_unmatched_requests_to_foreign_hosts() {
        // Arrange
        let (state, upstream, handler) = setup();
        let request = HttpRequest::request()
            .with_method("GET")
            .with_path("/remote")
            .with_header("Host", "example.com:8080");

        // Act
        let response = process(&handler, request.clone(), true).await;

        // Assert
        assert_eq!(response.body_as_string(), "upstream");
        assert_eq!(
            upstream.uris.lock().unwrap().clone(),
            vec!["http://example.com:8080/remote"]
        );
        let recorded = state.expectations().retrieve_recorded(None).unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].times, Times::once());
    }

    #[tokio::test]
    async fn does_not_proxy_requests_addressed_to_itself() {
        let (_, upstream, handler) = setup();
        let request = HttpRequest::request()
            .with_path("/local")
            .with_header("Host", "localhost:1080");

        let response = process(&handler, request, true).await;

        assert_eq!(response.status(), 404);
        assert!(upstream.uris.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn self_address_check_ignores_host_case() {
        // Arrange
        let (_, upstream, handler) = setup();
        let request = HttpRequest::request()
            .with_path("/local")
            .with_header("Host", "LOCALHOST:1080");

        // Act
        let response = process(&handler, request, true).await;

        // Assert
        assert_eq!(response.status(), 404);
        assert!(upstream.uris.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn matcher_failure_answers_500_and_keeps_serving() {
        // Arrange
        let state = Arc::new(HttpState::with_matcher(
            &Configuration::default(),
            system_clock(),
            Arc::new(FailingMatcher),
        ));
        let upstream = Arc::new(FakeUpstream::default());
        let handler = HttpActionHandler::new(state.clone(), upstream.clone());
        state.expectations().add(
            Expectation::new(HttpRequest::request().with_path("/a"))
                .then_respond(HttpResponse::response().with_body("a")),
        );

        // Act
        let first = process(&handler, HttpRequest::request().with_path("/a"), false).await;
        let second = process(&handler, HttpRequest::request().with_path("/a"), false).await;

        // Assert
        assert_eq!(first.status(), 500);
        assert!(first.body_as_string().contains("broken matcher"));
        assert_eq!(second.status(), 500);
        let exceptions = state
            .activity_log()
            .retrieve_messages(None, &[LogMessageType::Exception])
            .unwrap();
        assert_eq!(exceptions.len(), 2);
        assert!(upstream.uris.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn forward_action_targets_configured_host() {
        // Arrange
        let (state, upstream, handler) = setup();
        state
            .add(vec![Expectation::new(HttpRequest::request().with_path("/fwd"))
                .then_forward(HttpForward::forward("backend", 9000))])
            .unwrap();

        // Act
        let response = process(
            &handler,
            HttpRequest::request()
                .with_path("/fwd")
                .with_query_string_parameter("q", "a b"),
            false,
        )
        .await;

        // Assert
        assert_eq!(response.status(), 200);
        assert_eq!(
            upstream.uris.lock().unwrap().clone(),
            vec!["http://backend:9000/fwd?q=a+b"]
        );
    }

    #[test]
    fn upstream_request_skips_content_length() {
        let request = HttpRequest::request()
            .with_method("POST")
            .with_path("/p")
            .with_header("Content-Length", "3")
            .with_header("X-Id", "1")
            .with_body("abc");

        let upstream = to_upstream_request(&request, "http://h:1").unwrap();

        assert_eq!(upstream.method(), "POST");
        assert!(upstream.headers().get("content-length").is_none());
        assert_eq!(upstream.headers()["x-id"], "1");
        assert_eq!(upstream.body(), &Bytes::from_static(b"abc"));
    }
}
