use log::{debug, error, info};
use std::io::Error;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::dispatch::Incoming;
use crate::relay::RelayConfig;
use crate::session::Session;
use crate::Result;

/// Server construction parameters. Immutable once the server is built.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Connections beyond this count are dropped at accept time, before
    /// any protocol byte is exchanged.
    pub max_connections: usize,
    pub relay: RelayConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:1080".to_string(),
            max_connections: usize::MAX,
            relay: RelayConfig::default(),
        }
    }
}

/// Lifecycle notifications. Implementations may override any subset;
/// a server accepts any number of independent listeners.
pub trait ServerEvents: Send + Sync {
    fn on_listening(&self, _local: SocketAddr) {}
    fn on_error(&self, _error: &Error) {}
    fn on_close(&self) {}
}

/// SOCKS5 server: binds, admits connections and runs one session task
/// per accepted client.
pub struct Socks5Server {
    config: ServerConfig,
    events: Vec<Arc<dyn ServerEvents>>,
    hook: Option<mpsc::Sender<Incoming>>,
}

impl Socks5Server {
    pub fn new(config: ServerConfig) -> Socks5Server {
        Socks5Server {
            config,
            events: Vec::new(),
            hook: None,
        }
    }

    /// Adds a lifecycle listener. May be called any number of times.
    pub fn subscribe(&mut self, events: Arc<dyn ServerEvents>) {
        self.events.push(events);
    }

    /// Registers the connection-policy hook and returns its receiving
    /// end. One `Incoming` is delivered per session reaching dispatch;
    /// the receiver must settle each with exactly one of deny, accept
    /// or intercept. At most one hook is live per server; registering
    /// again replaces the previous one. Without a hook every session is
    /// auto-accepted.
    pub fn connections(&mut self) -> mpsc::Receiver<Incoming> {
        let (tx, rx) = mpsc::channel(1);
        self.hook = Some(tx);
        rx
    }

    /// Binds the listen address and starts accepting. The accept loop
    /// runs as a background task controlled through the returned handle.
    pub async fn listen(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        info!("socks5 server listening on {local_addr}");
        let events = Arc::new(self.events);
        for subscriber in events.iter() {
            subscriber.on_listening(local_addr);
        }

        let connections = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(accept_loop(
            listener,
            self.config,
            self.hook,
            events,
            connections.clone(),
            shutdown_rx,
        ));

        Ok(ServerHandle {
            local_addr,
            connections,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Owns one admission slot. The live count is incremented on creation
/// and released on drop, so it follows the client connection wherever
/// it travels: through the session, a pending dispatch handle, the
/// relay, or an intercepted stream.
#[derive(Debug)]
pub(crate) struct SessionGuard {
    connections: Arc<AtomicUsize>,
}

impl SessionGuard {
    fn new(connections: Arc<AtomicUsize>) -> Self {
        connections.fetch_add(1, Ordering::AcqRel);
        Self { connections }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Control handle for a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// The address the listener actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of sessions currently alive.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Stops accepting and waits for the accept loop to finish.
    /// Sessions already running are left to complete on their own.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    /// Runs until the accept loop ends.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: ServerConfig,
    hook: Option<mpsc::Sender<Incoming>>,
    events: Arc<Vec<Arc<dyn ServerEvents>>>,
    connections: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    // Hard admission cutoff: over the limit the socket is
                    // dropped without entering the state machine.
                    if connections.load(Ordering::Acquire) >= config.max_connections {
                        debug!("dropping {peer}: connection limit reached");
                        drop(socket);
                        continue;
                    }
                    let guard = SessionGuard::new(connections.clone());

                    let hook = hook.clone();
                    let relay_config = config.relay.clone();
                    tokio::spawn(async move {
                        let session = Session::new(socket, peer, guard);
                        if let Err(e) = session.run(hook, relay_config).await {
                            debug!("session {peer} ended: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("accept failed: {e}");
                    for subscriber in events.iter() {
                        subscriber.on_error(&e);
                    }
                }
            }
        }
    }

    info!("socks5 server closed");
    for subscriber in events.iter() {
        subscriber.on_close();
    }
}
