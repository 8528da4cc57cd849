/// A transport-agnostic connection.
///
/// Provides identity (`peer`) and byte-level I/O (`read`, `write_all`,
/// `shutdown`) so the engine can carry signaling frames and relay file
/// bytes without knowing whether it is talking over TCP or an in-memory
/// pipe.
pub trait Connection: Send + 'static {
    /// Returns a human-readable identifier for the remote end
    /// (e.g. `"127.0.0.1:54321"`).
    fn peer(&self) -> String;

    /// Reads bytes into `buf`, returning how many bytes were read.
    ///
    /// Returns `Ok(0)` when the remote end has closed the connection.
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a;

    /// Writes the entirety of `buf` to the connection.
    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a;

    /// Shuts down the write half of the connection, signalling to the
    /// remote end that no more data will be sent.
    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_;
}

/// An async listener that accepts incoming [`Connection`]s.
pub trait Listener: Send + 'static {
    /// The concrete connection type produced by [`accept`](Listener::accept).
    type Conn: Connection;

    /// Returns the local address the listener is bound to
    /// (e.g. `"0.0.0.0:9000"`).
    fn local_addr(&self) -> String;

    /// Returns the port the listener is bound to. For listeners bound on
    /// port `0` this is the port the OS assigned.
    fn local_port(&self) -> u16;

    /// Waits for and accepts the next inbound connection.
    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_;
}

/// Factory for creating [`Listener`] instances.
///
/// The engine binds its signaling listener through this trait, and the
/// rendezvous binds one short-lived listener per transfer leg.
pub trait ListenerFactory: Send + Sync + 'static {
    /// The concrete listener type produced by [`bind`](ListenerFactory::bind).
    type L: Listener;

    /// Binds a new listener to the given address.
    ///
    /// Use `"<ip>:0"` to let the OS assign an available port.
    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a;
}

/// Factory for creating outbound [`Connection`]s (client side).
///
/// Counterpart to [`ListenerFactory`]: the signaling client opens its
/// channel through this trait.
pub trait Connector: Send + Sync + 'static {
    /// The concrete connection type produced by [`connect`](Connector::connect).
    type Conn: Connection;

    /// Opens a new outbound connection to the given address.
    fn connect<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a;
}
