use log::{debug, warn};
use std::future::Future;
use std::io::{Error, ErrorKind};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{self, TcpStream};

use crate::protocol::{self, Socks5Request};
use crate::Result;

/// Knobs for the outbound leg. Both timeouts default to off; the relay
/// waits indefinitely on the resolver and the connect unless configured.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub resolve_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

/// Resolves the request destination, connects outbound, answers the
/// client with either a success reply carrying the egress address or a
/// mapped error reply, then splices both streams until one side closes.
///
/// Failures after the success reply has been written only tear the relay
/// down; the reply is sent exactly once per session.
pub async fn run(mut client: TcpStream, request: &Socks5Request, config: &RelayConfig) -> Result<()> {
    let resolved = match maybe_timeout(
        config.resolve_timeout,
        resolve(&request.destination, request.port),
    )
    .await
    {
        Ok(addr) => addr,
        Err(error) => return fail(client, error).await,
    };

    let mut upstream = match maybe_timeout(config.connect_timeout, connect(resolved)).await {
        Ok(stream) => stream,
        Err(error) => return fail(client, error).await,
    };

    let reply = protocol::encode_success_reply(upstream.local_addr()?)?;
    if client.write_all(&reply).await.is_err() {
        // Client went away between dispatch and connect success; close
        // the outbound side rather than relaying into a dead stream.
        let _ = upstream.shutdown().await;
        return Ok(());
    }

    debug!(
        "relaying {}:{} via {}",
        request.destination,
        request.port,
        upstream.local_addr()?
    );
    bridge(&mut client, &mut upstream).await
}

async fn resolve(destination: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = net::lookup_host((destination, port)).await?;
    addrs.next().ok_or_else(|| {
        Error::new(
            ErrorKind::NotFound,
            format!("no addresses for {destination}"),
        )
    })
}

async fn connect(addr: SocketAddr) -> Result<TcpStream> {
    TcpStream::connect(addr).await
}

async fn maybe_timeout<F, T>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(duration) => tokio::time::timeout(duration, fut)
            .await
            .map_err(|_| Error::new(ErrorKind::TimedOut, "relay operation timed out"))?,
        None => fut.await,
    }
}

/// Sends the mapped error reply, closes the client stream, and
/// propagates the original error for the caller's logging.
async fn fail(mut client: TcpStream, error: Error) -> Result<()> {
    let code = protocol::reply_code_for(&error);
    warn!("relay failed with {code}: {error}");
    let _ = client
        .write_all(&protocol::encode_error_reply(code))
        .await;
    let _ = client.shutdown().await;
    Err(error)
}

/// Splices two streams until either side closes, then tears both down.
pub async fn bridge(client: &mut TcpStream, upstream: &mut TcpStream) -> Result<()> {
    let (mut client_read, mut client_write) = io::split(client);
    let (mut upstream_read, mut upstream_write) = io::split(upstream);

    let outbound = pump(&mut client_read, &mut upstream_write);
    let inbound = pump(&mut upstream_read, &mut client_write);

    let _ = tokio::try_join!(outbound, inbound);
    Ok(())
}

async fn pump(
    src: &mut ReadHalf<&mut TcpStream>,
    dest: &mut WriteHalf<&mut TcpStream>,
) -> Result<()> {
    const BUF_SIZE: usize = 4096;
    let mut buf = [0; BUF_SIZE];

    loop {
        match src.read(&mut buf).await {
            Ok(len) if len > 0 => dest.write_all(&buf[0..len]).await?,
            _ => {
                dest.shutdown().await?;
                break Ok(());
            }
        }
    }
}
