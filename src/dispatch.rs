use log::debug;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use crate::protocol::{self, ReplyCode, Socks5Request, SYNTHETIC_SUCCESS_REPLY};
use crate::relay::{self, RelayConfig};
use crate::server::SessionGuard;
use crate::Result;

/// One accepted request awaiting a policy decision, delivered on the
/// server's connection channel.
#[derive(Debug)]
pub struct Incoming {
    pub request: Socks5Request,
    pub handle: DispatchHandle,
}

/// A restricted view over one session's client stream, live for the
/// duration of the dispatch decision.
///
/// Every operation consumes the handle, so exactly one of `deny`,
/// `accept`, `intercept` can run per session. Dropping the handle
/// without calling any of them closes the connection undecided.
///
/// The handle carries the session's admission slot; the server's live
/// count stays claimed until the decision has fully played out.
#[derive(Debug)]
pub struct DispatchHandle {
    stream: TcpStream,
    request: Socks5Request,
    config: RelayConfig,
    guard: SessionGuard,
}

impl DispatchHandle {
    pub(crate) fn new(
        stream: TcpStream,
        request: Socks5Request,
        config: RelayConfig,
        guard: SessionGuard,
    ) -> Self {
        Self {
            stream,
            request,
            config,
            guard,
        }
    }

    /// Refuses the request: writes the DISALLOW reply and closes.
    ///
    /// Best-effort on both counts, so denying a client that already hung
    /// up has no observable effect.
    pub async fn deny(mut self) {
        debug!("denying {}:{}", self.request.destination, self.request.port);
        let _ = self
            .stream
            .write_all(&protocol::encode_error_reply(ReplyCode::Disallowed))
            .await;
        let _ = self.stream.shutdown().await;
    }

    /// Approves the request and runs the relay engine to completion.
    ///
    /// Error replies are written to the client internally; the returned
    /// error only informs the caller why the relay ended.
    pub async fn accept(self) -> Result<()> {
        let result = relay::run(self.stream, &self.request, &self.config).await;
        drop(self.guard);
        result
    }

    /// Takes the connection over: answers the client with the fixed
    /// synthetic success reply and hands the raw stream back to the
    /// caller, who owns all payload semantics from here on.
    ///
    /// Yields once before returning so the caller regains control only
    /// on the next scheduling tick.
    pub async fn intercept(mut self) -> Result<InterceptedStream> {
        self.stream.write_all(&SYNTHETIC_SUCCESS_REPLY).await?;
        tokio::task::yield_now().await;
        Ok(InterceptedStream {
            stream: self.stream,
            _guard: self.guard,
        })
    }
}

/// The client stream handed over by [`DispatchHandle::intercept`].
///
/// Reads and writes pass straight through to the underlying stream.
/// The session's admission slot is released only when this is dropped,
/// so an intercepted connection still counts against the server limit.
#[derive(Debug)]
pub struct InterceptedStream {
    stream: TcpStream,
    _guard: SessionGuard,
}

impl AsyncRead for InterceptedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for InterceptedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
