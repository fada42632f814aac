use crate::{
    common::data::{HttpRequest, HttpResponse},
    server::{
        action::{ActionHandler, ResponseWriter},
        command::{self, CommandRouter, ControlPlane, Routing, TEXT_CONTENT_TYPE},
        config::Configuration,
        lifecycle::LifeCycle,
        log::{LogArgument, LogEntry, LogMessageType},
        state::StateManager,
    },
};
use async_trait::async_trait;
use http::{Method, StatusCode};
use std::{collections::HashSet, net::SocketAddr, sync::Arc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot build command routing: {0}")]
    RoutingError(#[from] command::Error),
}

/// Per connection state, fixed when the connection is accepted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionContext {
    pub proxying: bool,
    /// `Host` header values that address this server itself.
    pub local_addresses: HashSet<String>,
    pub remote_address: Option<SocketAddr>,
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: HttpRequest, context: &ConnectionContext) -> HttpResponse;
}

/// Request dispatcher: control plane commands are answered here, everything else goes to the
/// action engine.
pub struct HttpRequestHandler<S>
where
    S: StateManager + 'static,
{
    router: CommandRouter,
    control_plane: ControlPlane<S>,
    state: Arc<S>,
    action_handler: Arc<dyn ActionHandler>,
}

impl<S> HttpRequestHandler<S>
where
    S: StateManager + 'static,
{
    pub fn new(
        config: &Configuration,
        state: Arc<S>,
        lifecycle: Arc<dyn LifeCycle>,
        action_handler: Arc<dyn ActionHandler>,
    ) -> Result<Self, Error> {
        Ok(Self {
            router: CommandRouter::new(&config.base_path, config.liveness_path.as_deref())?,
            control_plane: ControlPlane::new(state.clone(), lifecycle),
            state,
            action_handler,
        })
    }

    fn error_response(&self, request: &HttpRequest, err: command::Error) -> HttpResponse {
        let status = err.status_code();
        if status.is_server_error() {
            tracing::error!("Failed to process control plane request: {}", err);
            self.state.log(
                LogEntry::new(LogMessageType::Exception)
                    .with_http_request(request.clone())
                    .with_message(
                        format!("exception processing request: {}:{{}}", err),
                        vec![LogArgument::Request(request.clone())],
                    ),
            );
        } else {
            tracing::debug!("Rejected control plane request: {}", err);
        }

        HttpResponse::response()
            .with_status_code(status.as_u16())
            .with_header(http::header::CONTENT_TYPE.as_str(), TEXT_CONTENT_TYPE)
            .with_body(err.to_string())
    }
}

#[async_trait]
impl<S> Handler for HttpRequestHandler<S>
where
    S: StateManager + 'static,
{
    async fn handle(&self, request: HttpRequest, context: &ConnectionContext) -> HttpResponse {
        tracing::trace!("Routing incoming request: {:?}", request);

        let routing = match Method::from_bytes(request.method_str().as_bytes()) {
            Ok(method) => self.router.route(&method, request.path_str()),
            Err(_) => Routing::DataPlane,
        };

        match routing {
            Routing::Command(command) => match self.control_plane.execute(command, &request).await
            {
                Ok(response) => response,
                Err(err) => self.error_response(&request, err),
            },
            Routing::NotFound => HttpResponse::not_found(),
            Routing::DataPlane => {
                self.state.log(
                    LogEntry::new(LogMessageType::ReceivedRequest)
                        .with_http_request(request.clone())
                        .with_message(
                            "received request:{}",
                            vec![LogArgument::Request(request.clone())],
                        ),
                );

                let (writer, receiver) = ResponseWriter::channel();
                self.action_handler
                    .process_action(
                        request,
                        writer,
                        context.remote_address,
                        &context.local_addresses,
                        context.proxying,
                        false,
                    )
                    .await;

                match receiver.await {
                    Ok(response) => response,
                    Err(_) => {
                        tracing::error!("Action handler finished without writing a response");
                        HttpResponse::response()
                            .with_status_code(StatusCode::INTERNAL_SERVER_ERROR.as_u16())
                    }
                }
            }
        }
    }
}
