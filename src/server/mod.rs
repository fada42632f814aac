pub mod action;
mod builder;
pub mod command;
pub mod config;
pub mod expectations;
pub mod handler;
pub mod lifecycle;
pub mod log;
pub mod matchers;
pub mod persistence;
#[allow(clippy::module_inception)]
pub mod server;
pub mod state;

use crate::server::{handler::HttpRequestHandler, server::MockServer, state::HttpState};

pub use builder::MockServerBuilder;
pub use server::Error;

pub type StandaloneMockServer = MockServer<HttpRequestHandler<HttpState>>;
