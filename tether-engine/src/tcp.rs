use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net;
use tracing::{debug, info};

use tether_core::listener::{Connection, Connector, Listener, ListenerFactory};

/// A TCP connection wrapping a [`tokio::net::TcpStream`].
pub struct TcpConnection {
    stream: net::TcpStream,
    peer_addr: String,
}

impl TcpConnection {
    fn new(stream: net::TcpStream, peer_addr: String) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
        }
        Self { stream, peer_addr }
    }
}

impl Connection for TcpConnection {
    fn peer(&self) -> String {
        self.peer_addr.clone()
    }

    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            self.stream
                .read(buf)
                .await
                .context("failed to read from TCP connection")
        }
    }

    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.stream
                .write_all(buf)
                .await
                .context("failed to write to TCP connection")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.stream
                .shutdown()
                .await
                .context("failed to shut down TCP connection")
        }
    }
}

/// A TCP listener wrapping a [`tokio::net::TcpListener`].
pub struct TcpListener {
    inner: net::TcpListener,
    local_addr: String,
    local_port: u16,
}

impl Listener for TcpListener {
    type Conn = TcpConnection;

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_ {
        async move {
            let (stream, addr) = self
                .inner
                .accept()
                .await
                .context("failed to accept TCP connection")?;
            let peer_addr = addr.to_string();
            debug!(peer = %peer_addr, local = %self.local_addr, "Accepted TCP connection");
            Ok(TcpConnection::new(stream, peer_addr))
        }
    }
}

/// Factory that binds [`TcpListener`] instances on the given address.
pub struct TcpListenerFactory;

impl ListenerFactory for TcpListenerFactory {
    type L = TcpListener;

    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a {
        async move {
            let inner = net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind TCP listener on {addr}"))?;
            let local = inner
                .local_addr()
                .context("failed to retrieve local address")?;
            info!(addr = %local, "TCP listener bound");
            Ok(TcpListener {
                inner,
                local_addr: local.to_string(),
                local_port: local.port(),
            })
        }
    }
}

/// Opens outbound [`TcpConnection`]s.
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Conn = TcpConnection;

    fn connect<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a {
        async move {
            let stream = net::TcpStream::connect(addr)
                .await
                .with_context(|| format!("failed to connect to {addr}"))?;
            let peer_addr = stream
                .peer_addr()
                .map_or_else(|_| addr.to_owned(), |a| a.to_string());
            debug!(peer = %peer_addr, "TCP connection established");
            Ok(TcpConnection::new(stream, peer_addr))
        }
    }
}
