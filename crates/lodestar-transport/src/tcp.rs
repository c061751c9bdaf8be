//! TCP transport: a listener that hands out framed connections.

use std::net::SocketAddr;

use tokio::net::{TcpListener, ToSocketAddrs};

use crate::{ConnectionId, FrameConfig, FramedConnection, Transport, TransportError};

/// A TCP [`Transport`] that listens for incoming connections.
pub struct TcpTransport {
    listener: TcpListener,
    frame: FrameConfig,
}

impl TcpTransport {
    /// Binds a new TCP transport to the given address.
    pub async fn bind<A>(addr: A, frame: FrameConfig) -> Result<Self, TransportError>
    where
        A: ToSocketAddrs + std::fmt::Debug,
    {
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| TransportError::BindFailed {
                addr: format!("{addr:?}"),
                source,
            })?;
        if let Ok(local) = listener.local_addr() {
            tracing::info!(%local, "TCP transport listening");
        }
        Ok(Self { listener, frame })
    }
}

impl Transport for TcpTransport {
    type Connection = FramedConnection;
    type Error = TransportError;

    async fn accept(&self) -> Result<Self::Connection, Self::Error> {
        let (stream, remote_addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;

        // Game traffic is small request/response frames; don't let Nagle sit on them.
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%remote_addr, error = %e, "set_nodelay failed");
        }

        let id = ConnectionId::next();
        tracing::debug!(%id, %remote_addr, "accepted TCP connection");

        let (reader, writer) = stream.into_split();
        Ok(FramedConnection::new(
            id,
            remote_addr,
            reader,
            writer,
            &self.frame,
        ))
    }

    fn local_addr(&self) -> Result<SocketAddr, Self::Error> {
        self.listener
            .local_addr()
            .map_err(TransportError::AcceptFailed)
    }
}
