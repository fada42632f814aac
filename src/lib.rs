//! `mockserver` is an HTTP mock and proxy server that is configured at runtime through a JSON
//! control plane.
//!
//! Requests under the control plane base path (`/mockserver` by default) manage the server:
//!
//! * `PUT /mockserver/expectation` adds or updates expectations,
//! * `PUT /mockserver/retrieve` returns recorded requests, request/response pairs, recorded or
//!   active expectations, or rendered logs,
//! * `PUT /mockserver/clear` and `PUT /mockserver/reset` remove state,
//! * `PUT /mockserver/status`, `PUT /mockserver/bind` and `PUT /mockserver/stop` manage ports.
//!
//! Every other request is matched against the active expectations. A match is answered with the
//! configured response or forwarded upstream. Unmatched requests get a `404`, unless the
//! connection is proxying, in which case requests for foreign hosts are forwarded.
//!
//! # Getting Started
//! ```no_run
//! use mockserver::MockServerBuilder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = MockServerBuilder::new()
//!         .port(1080)
//!         .liveness_path("/health")
//!         .build()?;
//!
//!     server.start().await?;
//!     Ok(())
//! }
//! ```
//!
//! Expectations use the same JSON layout on the wire, in initialization files and in logs:
//!
//! ```json
//! {
//!   "httpRequest" : { "method" : "GET", "path" : "/search" },
//!   "httpResponse" : { "statusCode" : 200, "body" : "found" },
//!   "times" : { "remainingTimes" : 1 }
//! }
//! ```
pub mod common;
pub mod server;

pub use common::data::{
    Expectation, HttpForward, HttpRequest, HttpResponse, PortBinding, Times, TimeToLive,
};
pub use server::{MockServerBuilder, StandaloneMockServer};
