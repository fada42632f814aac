use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot bind port {0}: {1}")]
    BindError(u16, std::io::Error),
    #[error("server is shutting down")]
    ShuttingDown,
}

/// What the control plane may ask of the transport layer.
#[async_trait]
pub trait LifeCycle: Send + Sync {
    /// Ports currently accepting connections.
    fn local_ports(&self) -> Vec<u16>;

    /// Binds additional ports. Port 0 binds an ephemeral port. Returns the ports actually bound.
    async fn bind_ports(&self, ports: Vec<u16>) -> Result<Vec<u16>, Error>;

    /// Shuts the transport down. Callers must not await this from a request they are answering.
    async fn stop(&self);
}
