use log::{debug, warn};
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::dispatch::{DispatchHandle, Incoming};
use crate::protocol::{self, ReplyCode, CMD_CONNECT, METHOD_NO_ACCEPTABLE, SOCKS_VERSION};
use crate::relay::{self, RelayConfig};
use crate::server::SessionGuard;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Negotiating,
    Authorized,
    DispatchPending,
}

/// One accepted client connection, exclusive owner of its stream until
/// the dispatch decision hands it onwards.
pub struct Session {
    stream: TcpStream,
    peer: SocketAddr,
    state: State,
    guard: SessionGuard,
}

impl Session {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr, guard: SessionGuard) -> Session {
        Session {
            stream,
            peer,
            state: State::Negotiating,
            guard,
        }
    }

    /// Drives the connection through negotiation, request parsing and
    /// dispatch. Terminal protocol outcomes (rejected negotiation,
    /// unsupported command, policy denial) are `Ok`; errors are I/O
    /// failures and fatal protocol violations.
    pub async fn run(
        mut self,
        hook: Option<mpsc::Sender<Incoming>>,
        config: RelayConfig,
    ) -> Result<()> {
        if !self.negotiate().await? {
            debug!("{} offered no acceptable auth method", self.peer);
            return Ok(());
        }
        self.state = State::Authorized;

        let request = protocol::read_request(&mut self.stream).await?;
        if request.version != SOCKS_VERSION {
            warn!("{} sent request version {}", self.peer, request.version);
        }

        if request.command != CMD_CONNECT {
            debug!("{} sent unsupported command {}", self.peer, request.command);
            self.stream
                .write_all(&protocol::encode_error_reply(ReplyCode::CommandUnsupported))
                .await?;
            self.stream.shutdown().await?;
            return Ok(());
        }

        self.state = State::DispatchPending;
        debug!(
            "{} requests {}:{} ({:?})",
            self.peer, request.destination, request.port, self.state
        );

        match hook {
            Some(tx) => {
                let incoming = Incoming {
                    request: request.clone(),
                    handle: DispatchHandle::new(self.stream, request, config, self.guard),
                };
                if let Err(mpsc::error::SendError(undelivered)) = tx.send(incoming).await {
                    // Hook receiver is gone; fall back to auto-accept.
                    undelivered.handle.accept().await?;
                }
                Ok(())
            }
            None => relay::run(self.stream, &request, &config).await,
        }
    }

    /// Runs method negotiation. Returns `false` after replying `0xFF`
    /// and closing when NOAUTH was not among the offered methods.
    async fn negotiate(&mut self) -> Result<bool> {
        let methods = protocol::read_method_selection(&mut self.stream).await?;
        let chosen = protocol::select_method(&methods);

        self.stream
            .write_all(&protocol::encode_method_reply(chosen))
            .await?;

        if chosen == METHOD_NO_ACCEPTABLE {
            self.stream.shutdown().await?;
            return Ok(false);
        }
        Ok(true)
    }
}
