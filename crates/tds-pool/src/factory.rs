//! Transport creation.

use tokio::io::{AsyncRead, AsyncWrite};

/// Opens transports for new pool connections.
///
/// The transport must already be past login: the pool only ever sends
/// requests on it and reads their responses.
#[async_trait::async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The byte stream of one connection.
    type Transport: AsyncRead + AsyncWrite + Send + 'static;

    /// Open a new transport.
    async fn connect(&self) -> std::io::Result<Self::Transport>;
}
