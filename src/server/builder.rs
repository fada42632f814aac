use crate::{
    common::{
        http::{HttpClient, HyperHttpClient},
        util::{system_clock, Clock},
    },
    server::{
        action::HttpActionHandler,
        config::Configuration,
        handler::HttpRequestHandler,
        log::{LogEntry, LogLevel, LogMessageType},
        persistence::load_initialization_file,
        server::{control_channel, MockServer, MockServerConfig},
        state::{HttpState, StateManager},
        StandaloneMockServer,
    },
};
use std::{error::Error, path::PathBuf, sync::Arc};

/// The `MockServerBuilder` collects configuration, fills in defaults and wires state, action
/// engine, dispatcher and transport together.
pub struct MockServerBuilder {
    config: Configuration,
    clock: Option<Arc<dyn Clock>>,
    http_client: Option<Arc<dyn HttpClient + Send + Sync + 'static>>,
}

impl Default for MockServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServerBuilder {
    /// Creates a new instance of `MockServerBuilder` with default settings.
    pub fn new() -> Self {
        MockServerBuilder {
            config: Configuration::default(),
            clock: None,
            http_client: None,
        }
    }

    /// Replaces the whole configuration.
    pub fn configuration(mut self, config: Configuration) -> Self {
        self.config = config;
        self
    }

    /// Sets a single port to listen on. Port 0 selects an ephemeral port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.ports = vec![port];
        self
    }

    /// Sets the ports to listen on.
    ///
    /// # Parameters
    /// - `ports`: The port numbers. Port 0 selects an ephemeral port.
    ///
    /// # Returns
    /// A modified `MockServerBuilder` instance for method chaining.
    pub fn ports(mut self, ports: Vec<u16>) -> Self {
        self.config.ports = ports;
        self
    }

    pub fn base_path<T: Into<String>>(mut self, base_path: T) -> Self {
        self.config.base_path = base_path.into();
        self
    }

    /// Enables a GET path that answers like the status command.
    pub fn liveness_path<T: Into<String>>(mut self, liveness_path: T) -> Self {
        self.config.liveness_path = Some(liveness_path.into());
        self
    }

    /// Sets the minimum level of log entries returned by log retrieval.
    pub fn log_level(mut self, log_level: LogLevel) -> Self {
        self.config.log_level = log_level;
        self
    }

    pub fn max_expectations(mut self, max_expectations: usize) -> Self {
        self.config.max_expectations = max_expectations;
        self
    }

    pub fn max_log_entries(mut self, max_log_entries: usize) -> Self {
        self.config.max_log_entries = max_log_entries;
        self
    }

    /// Sets whether connections start in proxy mode.
    ///
    /// # Parameters
    /// - `proxy`: A boolean indicating whether unmatched requests to foreign hosts are forwarded.
    ///
    /// # Returns
    /// A modified `MockServerBuilder` instance for method chaining.
    pub fn proxy(mut self, proxy: bool) -> Self {
        self.config.proxy = proxy;
        self
    }

    /// Sets whether the server should be exposed to external access.
    pub fn expose(mut self, expose: bool) -> Self {
        self.config.expose = expose;
        self
    }

    /// Sets a JSON file with expectations that are loaded on startup.
    pub fn initialization_json_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.initialization_json_path = Some(path.into());
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the client used to forward requests upstream.
    pub fn http_client(mut self, http_client: Arc<dyn HttpClient + Send + Sync + 'static>) -> Self {
        self.http_client = Some(http_client);
        self
    }

    /// Builds the server with a fresh state.
    ///
    /// # Returns
    /// A `StandaloneMockServer` instance or an error if the configuration is invalid or the
    /// initialization file cannot be loaded.
    pub fn build(self) -> Result<StandaloneMockServer, Box<dyn Error>> {
        let clock = self.clock.clone().unwrap_or_else(system_clock);
        let state = Arc::new(HttpState::new(&self.config, clock));
        self.build_with_state(state)
    }

    /// Builds the server on top of an existing state.
    pub fn build_with_state<S>(
        self,
        state: Arc<S>,
    ) -> Result<MockServer<HttpRequestHandler<S>>, Box<dyn Error>>
    where
        S: StateManager + 'static,
    {
        self.config.validate()?;

        if let Some(path) = &self.config.initialization_json_path {
            let count = load_initialization_file(path, state.as_ref())?;
            tracing::info!("Loaded {} expectation(s) from initialization file", count);
        }

        let http_client: Arc<dyn HttpClient + Send + Sync + 'static> = match self.http_client {
            Some(http_client) => http_client,
            None => Arc::new(HyperHttpClient::new()),
        };
        let action_handler = Arc::new(HttpActionHandler::new(state.clone(), http_client));
        let (control, control_receiver) = control_channel();

        let handler = HttpRequestHandler::new(&self.config, state.clone(), control, action_handler)?;

        state.log(LogEntry::new(LogMessageType::ServerConfiguration).with_message(
            format!(
                "using base path {} with log level {} on ports {:?}",
                self.config.base_path, self.config.log_level, self.config.ports
            ),
            vec![],
        ));

        Ok(MockServer::new(
            Arc::new(handler),
            MockServerConfig {
                ports: self.config.ports.clone(),
                expose: self.config.expose,
                proxy: self.config.proxy,
            },
            control_receiver,
        ))
    }
}

#[cfg(test)]
mod test {
    use crate::server::{builder::MockServerBuilder, log::LogLevel};

    #[test]
    fn rejects_invalid_configuration() {
        let result = MockServerBuilder::new().base_path("mockserver/").build();
        assert!(result.is_err());
    }

    #[test]
    fn rejects_missing_initialization_file() {
        let result = MockServerBuilder::new()
            .initialization_json_path("/definitely/not/here.json")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn builds_with_custom_settings() {
        let result = MockServerBuilder::new()
            .ports(vec![0, 0])
            .base_path("/admin")
            .liveness_path("/health")
            .log_level(LogLevel::Warn)
            .max_expectations(10)
            .max_log_entries(10)
            .proxy(true)
            .build();
        assert!(result.is_ok());
    }
}
