use crate::{
    common::data::{self, HttpRequest, HttpResponse},
    server::{
        handler::{ConnectionContext, Handler},
        lifecycle::{self, LifeCycle},
        server::Error::{
            BufferError, LocalSocketAddrError, PublishSocketAddrError, RequestConversionError,
            ResponseConstructionError, ServerConnectionError, SocketBindError,
        },
    },
};
use async_trait::async_trait;
use futures_util::FutureExt;
use http::{Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::{
    body::{Bytes, Incoming},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ServerBuilder,
};
use std::{
    collections::HashSet,
    convert::TryFrom,
    future::{pending, Future},
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot, watch},
    task::spawn,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot bind to socket addr {0}: {1}")]
    SocketBindError(SocketAddr, std::io::Error),
    #[error("cannot parse socket address: {0}")]
    SocketAddrParseError(#[from] std::net::AddrParseError),
    #[error("cannot obtain local address: {0}")]
    LocalSocketAddrError(std::io::Error),
    #[error("cannot publish bound socket addresses {0:?}")]
    PublishSocketAddrError(Vec<SocketAddr>),
    #[error("cannot create response: {0}")]
    ResponseConstructionError(http::Error),
    #[error("buffering error: {0}")]
    BufferError(hyper::Error),
    #[error("cannot convert request: {0}")]
    RequestConversionError(data::Error),
    #[error("Server error: {0}")]
    ServerConnectionError(Box<dyn std::error::Error + Send + Sync>),
}

enum ControlMessage {
    Bind(Vec<u16>, oneshot::Sender<Result<Vec<u16>, lifecycle::Error>>),
    Stop,
}

/// The transport side of [`LifeCycle`]: forwards bind and stop requests to the running server.
pub struct ServerControl {
    sender: mpsc::UnboundedSender<ControlMessage>,
    ports: Arc<Mutex<Vec<u16>>>,
}

impl ServerControl {
    fn lock_ports(&self) -> std::sync::MutexGuard<'_, Vec<u16>> {
        self.ports.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl LifeCycle for ServerControl {
    fn local_ports(&self) -> Vec<u16> {
        self.lock_ports().clone()
    }

    async fn bind_ports(&self, ports: Vec<u16>) -> Result<Vec<u16>, lifecycle::Error> {
        let (reply, result) = oneshot::channel();
        self.sender
            .send(ControlMessage::Bind(ports, reply))
            .map_err(|_| lifecycle::Error::ShuttingDown)?;
        result.await.map_err(|_| lifecycle::Error::ShuttingDown)?
    }

    async fn stop(&self) {
        if self.sender.send(ControlMessage::Stop).is_err() {
            tracing::debug!("Server is already stopped");
        }
    }
}

/// Receiving end of the control channel, consumed by [`MockServer`].
pub struct ControlReceiver {
    receiver: mpsc::UnboundedReceiver<ControlMessage>,
    ports: Arc<Mutex<Vec<u16>>>,
}

pub fn control_channel() -> (Arc<ServerControl>, ControlReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let ports = Arc::new(Mutex::new(Vec::new()));
    (
        Arc::new(ServerControl {
            sender,
            ports: ports.clone(),
        }),
        ControlReceiver { receiver, ports },
    )
}

pub struct MockServerConfig {
    pub ports: Vec<u16>,
    pub expose: bool,
    pub proxy: bool,
}

struct Connections<H>
where
    H: Handler + 'static,
{
    handler: Arc<H>,
    expose: bool,
    proxy: bool,
}

/// Accepts connections on any number of ports and hands buffered requests to the handler.
pub struct MockServer<H>
where
    H: Handler + 'static,
{
    handler: Arc<H>,
    config: MockServerConfig,
    control: ControlReceiver,
}

impl<H> MockServer<H>
where
    H: Handler + 'static,
{
    pub fn new(handler: Arc<H>, config: MockServerConfig, control: ControlReceiver) -> Self {
        MockServer {
            handler,
            config,
            control,
        }
    }

    /// Runs until a stop command is received.
    pub async fn start(self) -> Result<(), Error> {
        self.start_with_signals(None, pending()).await
    }

    /// Runs until a stop command is received or `shutdown` resolves. The addresses of the
    /// initially bound ports are published through `socket_addr_sender`.
    pub async fn start_with_signals<F>(
        self,
        socket_addr_sender: Option<oneshot::Sender<Vec<SocketAddr>>>,
        shutdown: F,
    ) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let MockServer {
            handler,
            config,
            control,
        } = self;
        let ControlReceiver {
            mut receiver,
            ports,
        } = control;

        let connections = Arc::new(Connections {
            handler,
            expose: config.expose,
            proxy: config.proxy,
        });
        let (stop_sender, stop_receiver) = watch::channel(false);

        let mut addresses = Vec::with_capacity(config.ports.len());
        for port in &config.ports {
            let listener = connections.bind(*port).await?;
            let address = listener.local_addr().map_err(LocalSocketAddrError)?;
            addresses.push(address);
            spawn(connections.clone().run_accept_loop(listener, stop_receiver.clone()));
        }
        register_ports(&ports, addresses.iter().map(SocketAddr::port));

        if let Some(sender) = socket_addr_sender {
            sender.send(addresses.clone()).map_err(PublishSocketAddrError)?;
        }

        tracing::info!("Listening on {:?}", addresses);

        let shutdown = shutdown.fuse();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                message = receiver.recv() => match message {
                    Some(ControlMessage::Bind(requested, reply)) => {
                        let result = connections.bind_additional(requested, &stop_receiver).await;
                        if let Ok(bound) = &result {
                            register_ports(&ports, bound.iter().copied());
                        }
                        if reply.send(result).is_err() {
                            tracing::debug!("Bind requester went away");
                        }
                    }
                    Some(ControlMessage::Stop) | None => break,
                },
                _ = &mut shutdown => break,
            }
        }

        tracing::info!("Stopping server");
        if stop_sender.send(true).is_err() {
            tracing::debug!("No accept loop was running");
        }
        ports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();

        Ok(())
    }
}

fn register_ports(ports: &Mutex<Vec<u16>>, bound: impl Iterator<Item = u16>) {
    let mut ports = ports.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    for port in bound {
        if !ports.contains(&port) {
            ports.push(port);
        }
    }
}

impl<H> Connections<H>
where
    H: Handler + 'static,
{
    async fn bind(&self, port: u16) -> Result<TcpListener, Error> {
        let host = if self.expose { "0.0.0.0" } else { "127.0.0.1" };
        let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
        TcpListener::bind(addr)
            .await
            .map_err(|e| SocketBindError(addr, e))
    }

    async fn bind_additional(
        self: &Arc<Self>,
        ports: Vec<u16>,
        stop_receiver: &watch::Receiver<bool>,
    ) -> Result<Vec<u16>, lifecycle::Error> {
        let mut listeners = Vec::with_capacity(ports.len());
        for port in ports {
            let listener = match self.bind(port).await {
                Ok(listener) => listener,
                Err(SocketBindError(_, err)) => return Err(lifecycle::Error::BindError(port, err)),
                Err(err) => {
                    return Err(lifecycle::Error::BindError(
                        port,
                        std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()),
                    ))
                }
            };
            let bound = listener
                .local_addr()
                .map_err(|err| lifecycle::Error::BindError(port, err))?
                .port();
            listeners.push((bound, listener));
        }

        let mut bound_ports = Vec::with_capacity(listeners.len());
        for (port, listener) in listeners {
            tracing::info!("Listening on additional port {}", port);
            spawn(self.clone().run_accept_loop(listener, stop_receiver.clone()));
            bound_ports.push(port);
        }

        Ok(bound_ports)
    }

    async fn run_accept_loop(self: Arc<Self>, listener: TcpListener, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((tcp_stream, remote_address)) => {
                            let connections = self.clone();
                            spawn(async move {
                                if let Err(err) = connections.handle_tcp_stream(tcp_stream, remote_address).await {
                                    tracing::error!("{:?}", err);
                                }
                            });
                        },
                        Err(err) =>  {
                            tracing::error!("TCP error: {:?}", err);
                        },
                    };
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn handle_tcp_stream(
        self: Arc<Self>,
        tcp_stream: TcpStream,
        remote_address: SocketAddr,
    ) -> Result<(), Error> {
        tracing::trace!("new TCP connection incoming from {}", remote_address);

        let local_address = tcp_stream.local_addr().map_err(LocalSocketAddrError)?;
        let context = Arc::new(ConnectionContext {
            proxying: self.proxy,
            local_addresses: local_addresses(&local_address),
            remote_address: Some(remote_address),
        });

        let mut server_builder = ServerBuilder::new(TokioExecutor::new());
        server_builder.http1().preserve_header_case(true);
        server_builder.http2();

        server_builder
            .serve_connection(
                TokioIo::new(tcp_stream),
                service_fn(|req| self.clone().service(req, context.clone())),
            )
            .await
            .map_err(ServerConnectionError)
    }

    async fn service(
        self: Arc<Self>,
        req: Request<Incoming>,
        context: Arc<ConnectionContext>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Error> {
        tracing::trace!("New HTTP request received: {}", req.uri());

        let req = match buffer_request(req).await {
            Ok(req) => req,
            Err(err) => {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, BufferError(err));
            }
        };

        let request = match HttpRequest::try_from(&req) {
            Ok(request) => request,
            Err(err) => return error_response(StatusCode::BAD_REQUEST, RequestConversionError(err)),
        };

        let response = self.handler.handle(request, &context).await;
        to_service_response(&response)
    }
}

/// `Host` header values under which a connection reaches this server.
fn local_addresses(local_address: &SocketAddr) -> HashSet<String> {
    let port = local_address.port();
    [
        format!("{}:{}", local_address.ip(), port),
        format!("localhost:{}", port),
        format!("127.0.0.1:{}", port),
    ]
    .into_iter()
    .collect()
}

async fn buffer_request(req: Request<Incoming>) -> Result<Request<Bytes>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    Ok(Request::from_parts(parts, body))
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn error_response(
    code: StatusCode,
    err: Error,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Error> {
    tracing::error!("failed to process request: {}", err);
    Response::builder()
        .status(code)
        .body(full(err.to_string()))
        .map_err(ResponseConstructionError)
}

fn to_service_response(
    response: &HttpResponse,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Error> {
    let response = match Response::<Bytes>::try_from(response) {
        Ok(response) => response,
        Err(err) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ResponseConstructionError(err),
            )
        }
    };
    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, full(body)))
}
