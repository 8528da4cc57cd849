use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::listener::{Connection, Listener, ListenerFactory};
use tether_core::protocol::{ConnectionId, Role};

use crate::auth::Authenticator;
use crate::channel::{ChannelHandler, ConnectionHandler};
use crate::control::ControlPlane;
use crate::rendezvous::{Rendezvous, RendezvousConfig};
use crate::router::Router;
use crate::store::{SessionStore, TransferStatus};

// ── Engine commands (UI → engine) ───────────────────────────────────

/// Commands sent by the CLI to control the engine.
#[derive(Clone, Debug)]
pub enum EngineCmd {
    /// Bind the signaling listener on `addr` and start accepting channels.
    StartAccepting { addr: String },
    /// Stop accepting new connections (drop the listener). Open channels
    /// stay up.
    StopAccepting,
    /// Close every channel and rendezvous, then stop the loop.
    ShutDown,
}

// ── Engine events (engine → UI) ─────────────────────────────────────

/// Events emitted by the engine for the CLI to observe.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    /// The listener is bound and accepting connections on `addr`.
    Accepting { addr: String },
    /// The listener has been stopped.
    AcceptingStopped,
    /// A signaling channel completed its hello handshake.
    ChannelOpened {
        connection_id: ConnectionId,
        session_id: String,
        user_id: String,
        role: Role,
        peer: String,
    },
    ChannelClosed {
        connection_id: ConnectionId,
        session_id: String,
    },
    /// A TCP rendezvous ended, successfully or not.
    TransferFinished {
        session_id: String,
        transfer_id: String,
        status: TransferStatus,
        bytes: u64,
    },
    /// A non-fatal error occurred inside the engine.
    Error { message: String },
}

// ── Engine handle ───────────────────────────────────────────────────

/// Handle returned by [`Engine::start`].  Lets the caller send commands,
/// subscribe to events and inspect sessions.
pub struct EngineHandle {
    pub cmd_tx: mpsc::Sender<EngineCmd>,
    pub events_tx: broadcast::Sender<EngineEvent>,
    pub router: Arc<Router>,
}

// ── Engine ──────────────────────────────────────────────────────────

/// Configuration shared by every channel and rendezvous.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Interface the per-transfer listeners bind on.
    pub rendezvous_host: String,
    /// An active session idle this long ends on next access.
    pub inactivity_timeout: Duration,
    /// Bound on each rendezvous accept and on the wait for the receiver.
    pub rendezvous_timeout: Duration,
    /// Time a new connection has to send its first frame.
    pub handshake_timeout: Duration,
    /// Events queued per connection before new ones are dropped.
    pub outbox_capacity: usize,
    pub chunk_size: usize,
    pub bind_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rendezvous_host: "0.0.0.0".into(),
            inactivity_timeout: Duration::from_secs(30 * 60),
            rendezvous_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            outbox_capacity: 256,
            chunk_size: 8192,
            bind_attempts: 3,
        }
    }
}

/// The Tether relay engine.
///
/// Owns the signaling listener. Each accepted connection is served by a
/// [`ChannelHandler`] in its own task, sharing one [`Router`] and one
/// rendezvous for the whole process.
///
/// The engine is generic over `F: ListenerFactory`, used both for the
/// signaling listener and for the per-transfer rendezvous listeners.
pub struct Engine;

impl Engine {
    /// Spawn the engine event loop and return a handle to control it.
    ///
    /// The engine starts idle: no listener is active until a
    /// [`EngineCmd::StartAccepting`] arrives.
    pub fn start<F>(
        self,
        factory: F,
        store: Arc<dyn SessionStore>,
        auth: Arc<dyn Authenticator>,
        config: EngineConfig,
    ) -> EngineHandle
    where
        F: ListenerFactory,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCmd>(32);
        let (events_tx, _) = broadcast::channel::<EngineEvent>(128);
        let shutdown = CancellationToken::new();

        let factory = Arc::new(factory);
        let router = Arc::new(Router::new(
            store,
            config.inactivity_timeout,
            config.outbox_capacity,
        ));
        let rendezvous = Rendezvous::new(
            Arc::clone(&factory),
            Arc::clone(&router),
            RendezvousConfig {
                host: config.rendezvous_host.clone(),
                accept_timeout: config.rendezvous_timeout,
                chunk_size: config.chunk_size,
                bind_attempts: config.bind_attempts,
            },
            events_tx.clone(),
            shutdown.clone(),
        );
        let control = Arc::new(ControlPlane::new(Arc::clone(&router), rendezvous));
        let handler = Arc::new(ChannelHandler::new(
            control,
            auth,
            config.handshake_timeout,
            events_tx.clone(),
            shutdown.clone(),
        ));

        info!("Spawning engine event loop");

        tokio::spawn(run_engine_loop(
            factory,
            handler,
            cmd_rx,
            events_tx.clone(),
            shutdown,
        ));

        debug!("Engine started successfully");
        EngineHandle {
            cmd_tx,
            events_tx,
            router,
        }
    }
}

/// The main engine event loop, extracted as a standalone async fn so that
/// the generic bounds don't infect `Engine` itself.
async fn run_engine_loop<F, H>(
    factory: Arc<F>,
    handler: Arc<H>,
    mut cmd_rx: mpsc::Receiver<EngineCmd>,
    events: broadcast::Sender<EngineEvent>,
    shutdown: CancellationToken,
) where
    F: ListenerFactory,
    H: ConnectionHandler<<F::L as Listener>::Conn>,
{
    debug!("Engine event loop running");

    let mut listener: Option<F::L> = None;

    loop {
        tokio::select! {
            biased;

            // ── Commands ────────────────────────────────────────
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(EngineCmd::StartAccepting { addr }) => {
                        info!(addr = %addr, "Received StartAccepting command");
                        match factory.bind(&addr).await {
                            Ok(l) => {
                                let bound_addr = l.local_addr();
                                info!(addr = %bound_addr, "Listener bound");
                                listener = Some(l);
                                let _ = events.send(EngineEvent::Accepting {
                                    addr: bound_addr,
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "Failed to bind listener");
                                let _ = events.send(EngineEvent::Error {
                                    message: format!("{e:#}"),
                                });
                            }
                        }
                    }

                    Some(EngineCmd::StopAccepting) => {
                        info!("Received StopAccepting command");
                        listener = None;
                        let _ = events.send(EngineEvent::AcceptingStopped);
                    }

                    Some(EngineCmd::ShutDown) => {
                        info!("Received ShutDown command");
                        break;
                    }

                    None => {
                        debug!("Command channel closed, shutting down");
                        break;
                    }
                }
            }

            // ── Accept inbound connections ───────────────────────
            result = async {
                if let Some(l) = listener.as_mut() {
                    l.accept().await
                } else {
                    std::future::pending().await
                }
            }, if listener.is_some() => {
                match result {
                    Ok(conn) => {
                        debug!(peer = %Connection::peer(&conn), "Connection accepted");
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            handler.handle(conn).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        let _ = events.send(EngineEvent::Error {
                            message: format!("{e:#}"),
                        });
                    }
                }
            }
        }
    }

    shutdown.cancel();
    info!("Engine event loop stopped");
}

// ── Tests ───────────────────────────────────────────────────────────
