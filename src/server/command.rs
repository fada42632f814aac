use crate::{
    common::{
        data::{self, Body, ClearType, Format, HttpRequest, HttpResponse, PortBinding, RetrieveType},
        serialization::{
            self, deserialize_expectations, deserialize_port_binding, deserialize_request_filter,
            serialize_list, to_pretty_json,
        },
    },
    server::{
        lifecycle::{self, LifeCycle},
        state::{self, Retrieved, StateManager},
    },
};
use http::{Method, StatusCode};
use path_tree::PathTree;
use std::{str::FromStr, sync::Arc};
use thiserror::Error;

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    InvalidParameter(#[from] data::Error),
    #[error("{0}")]
    InvalidBody(serialization::Error),
    #[error("{0}")]
    ResponseSerializeError(serialization::Error),
    #[error("{0}")]
    StateError(#[from] state::Error),
    #[error("{0}")]
    BindError(#[from] lifecycle::Error),
    #[error("no route registered for the {0:?} command")]
    IncompleteRouting(Command),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidParameter(_) | Error::InvalidBody(_) | Error::BindError(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::ResponseSerializeError(_)
            | Error::StateError(_)
            | Error::IncompleteRouting(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Retrieve,
    Clear,
    Reset,
    Expectation,
    Status,
    Bind,
    Stop,
}

impl Command {
    pub const ALL: [Command; 7] = [
        Command::Retrieve,
        Command::Clear,
        Command::Reset,
        Command::Expectation,
        Command::Status,
        Command::Bind,
        Command::Stop,
    ];

    pub fn path_suffix(&self) -> &'static str {
        match self {
            Command::Retrieve => "/retrieve",
            Command::Clear => "/clear",
            Command::Reset => "/reset",
            Command::Expectation => "/expectation",
            Command::Status => "/status",
            Command::Bind => "/bind",
            Command::Stop => "/stop",
        }
    }

    pub fn method(&self) -> Method {
        Method::PUT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Command(Command),
    Liveness,
}

/// Where a request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    Command(Command),
    /// Under the reserved base path but not a known command.
    NotFound,
    DataPlane,
}

/// Maps path and method to a control plane command.
pub struct CommandRouter {
    path_tree: PathTree<Route>,
    base_path: String,
    liveness_path: Option<String>,
}

impl CommandRouter {
    /// Builds the routing table and checks that every command is reachable.
    pub fn new(base_path: &str, liveness_path: Option<&str>) -> Result<Self, Error> {
        let mut path_tree: PathTree<Route> = PathTree::new();
        #[allow(unused_must_use)]
        {
            for command in Command::ALL {
                path_tree.insert(
                    &format!("{}{}", base_path, command.path_suffix()),
                    Route::Command(command),
                );
            }

            if let Some(liveness_path) = liveness_path {
                path_tree.insert(liveness_path, Route::Liveness);
            }
        }

        let router = Self {
            path_tree,
            base_path: base_path.to_string(),
            liveness_path: liveness_path.map(str::to_string),
        };

        for command in Command::ALL {
            let path = format!("{}{}", base_path, command.path_suffix());
            if router.route(&command.method(), &path) != Routing::Command(command) {
                return Err(Error::IncompleteRouting(command));
            }
        }

        Ok(router)
    }

    pub fn route(&self, method: &Method, path: &str) -> Routing {
        let route = self.path_tree.find(path).map(|(route, _)| *route);

        match route {
            Some(Route::Command(command)) if *method == command.method() => {
                return Routing::Command(command)
            }
            Some(Route::Liveness)
                if *method == Method::GET && self.liveness_path.as_deref() == Some(path) =>
            {
                return Routing::Command(Command::Status)
            }
            _ => {}
        }

        if path == self.base_path || path.starts_with(&format!("{}/", self.base_path)) {
            return Routing::NotFound;
        }

        Routing::DataPlane
    }
}

/// Executes control plane commands against the shared state and the transport.
pub struct ControlPlane<S>
where
    S: StateManager + 'static,
{
    state: Arc<S>,
    lifecycle: Arc<dyn LifeCycle>,
}

impl<S> ControlPlane<S>
where
    S: StateManager + 'static,
{
    pub fn new(state: Arc<S>, lifecycle: Arc<dyn LifeCycle>) -> Self {
        Self { state, lifecycle }
    }

    pub async fn execute(
        &self,
        command: Command,
        request: &HttpRequest,
    ) -> Result<HttpResponse, Error> {
        tracing::debug!("Executing {:?} command", command);

        match command {
            Command::Retrieve => self.retrieve(request),
            Command::Clear => self.clear(request),
            Command::Reset => {
                self.state.reset();
                Ok(HttpResponse::response())
            }
            Command::Expectation => self.add_expectations(request),
            Command::Status => {
                json_response(StatusCode::OK, &PortBinding::new(self.lifecycle.local_ports()))
            }
            Command::Bind => self.bind(request).await,
            Command::Stop => {
                let lifecycle = self.lifecycle.clone();
                tokio::spawn(async move {
                    lifecycle.stop().await;
                });
                Ok(HttpResponse::response())
            }
        }
    }

    fn retrieve(&self, request: &HttpRequest) -> Result<HttpResponse, Error> {
        let retrieve_type = match request.first_query_string_parameter("type") {
            Some(value) => RetrieveType::from_str(value)?,
            None => RetrieveType::Requests,
        };
        let _format = match request.first_query_string_parameter("format") {
            Some(value) => Format::from_str(value)?,
            None => Format::Json,
        };
        let filter = read_filter(request)?;

        let body = match self.state.retrieve(retrieve_type, filter)? {
            Retrieved::Requests(requests) => serialize_list("requests", &requests),
            Retrieved::RequestResponses(pairs) => serialize_list("requests and responses", &pairs),
            Retrieved::Expectations(expectations) => serialize_list("expectations", &expectations),
            Retrieved::Logs(logs) => {
                return Ok(HttpResponse::response()
                    .with_header(http::header::CONTENT_TYPE.as_str(), TEXT_CONTENT_TYPE)
                    .with_body(Body::String(logs)))
            }
        }
        .map_err(Error::ResponseSerializeError)?;

        Ok(with_json(HttpResponse::response(), body))
    }

    fn clear(&self, request: &HttpRequest) -> Result<HttpResponse, Error> {
        let clear_type = match request.first_query_string_parameter("type") {
            Some(value) => ClearType::from_str(value)?,
            None => ClearType::All,
        };
        let filter = read_filter(request)?;

        self.state.clear(clear_type, filter)?;
        Ok(HttpResponse::response())
    }

    fn add_expectations(&self, request: &HttpRequest) -> Result<HttpResponse, Error> {
        let expectations =
            deserialize_expectations(&request.body_bytes()).map_err(Error::InvalidBody)?;
        let active = self.state.add(expectations)?;

        let body = serialize_list("expectations", &active).map_err(Error::ResponseSerializeError)?;
        Ok(with_json(
            HttpResponse::response().with_status_code(StatusCode::CREATED.as_u16()),
            body,
        ))
    }

    async fn bind(&self, request: &HttpRequest) -> Result<HttpResponse, Error> {
        let requested =
            deserialize_port_binding(&request.body_bytes()).map_err(Error::InvalidBody)?;
        let bound = self.lifecycle.bind_ports(requested.ports).await?;
        tracing::info!("Bound ports {:?}", bound);

        json_response(StatusCode::OK, &PortBinding::new(bound))
    }
}

fn read_filter(request: &HttpRequest) -> Result<Option<HttpRequest>, Error> {
    deserialize_request_filter(&request.body_bytes()).map_err(Error::InvalidBody)
}

fn with_json(response: HttpResponse, body: String) -> HttpResponse {
    response
        .with_header(http::header::CONTENT_TYPE.as_str(), JSON_CONTENT_TYPE)
        .with_body(Body::String(body))
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Result<HttpResponse, Error> {
    let body = to_pretty_json("response", value).map_err(Error::ResponseSerializeError)?;
    Ok(with_json(
        HttpResponse::response().with_status_code(status.as_u16()),
        body,
    ))
}

#[cfg(test)]
mod test {
    use crate::server::command::{Command, CommandRouter, Routing};
    use http::Method;

    #[test]
    fn routes_every_command_under_the_base_path() {
        // Arrange
        let router = CommandRouter::new("/mockserver", None).unwrap();

        // Assert
        for command in Command::ALL {
            let path = format!("/mockserver{}", command.path_suffix());
            assert_eq!(router.route(&Method::PUT, &path), Routing::Command(command));
        }
    }

    #[test]
    fn unknown_reserved_paths_and_wrong_methods_are_not_found() {
        let router = CommandRouter::new("/mockserver", None).unwrap();

        assert_eq!(router.route(&Method::PUT, "/mockserver/unknown"), Routing::NotFound);
        assert_eq!(router.route(&Method::GET, "/mockserver/retrieve"), Routing::NotFound);
        assert_eq!(router.route(&Method::PUT, "/mockserver"), Routing::NotFound);
    }

    #[test]
    fn everything_else_is_data_plane() {
        let router = CommandRouter::new("/mockserver", None).unwrap();

        assert_eq!(router.route(&Method::GET, "/request_one"), Routing::DataPlane);
        assert_eq!(router.route(&Method::PUT, "/mockserverx/status"), Routing::DataPlane);
        assert_eq!(router.route(&Method::GET, "/livenessProbe"), Routing::DataPlane);
    }

    #[test]
    fn liveness_path_is_a_get_alias_for_status() {
        // Arrange
        let router = CommandRouter::new("/mockserver", Some("/livenessProbe")).unwrap();

        // Assert
        assert_eq!(
            router.route(&Method::GET, "/livenessProbe"),
            Routing::Command(Command::Status)
        );
        assert_eq!(router.route(&Method::POST, "/livenessProbe"), Routing::DataPlane);
    }

    #[test]
    fn custom_base_path() {
        let router = CommandRouter::new("/admin", None).unwrap();

        assert_eq!(
            router.route(&Method::PUT, "/admin/reset"),
            Routing::Command(Command::Reset)
        );
        assert_eq!(router.route(&Method::PUT, "/mockserver/reset"), Routing::DataPlane);
    }
}
