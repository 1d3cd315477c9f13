// Transport connector
//
// Opens the TCP stream and performs the handshake. Both ends write the
// handshake literal and expect to read it back, whichever side listened.

use crate::config::ConnectionConfig;
use crate::protocol::{SdbError, SdbResult, HANDSHAKE};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

/// Exchange the handshake literal, bounded by `config.handshake_timeout`
pub async fn handshake<S>(stream: &mut S, config: &ConnectionConfig) -> SdbResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Performing handshake");

    tokio::time::timeout(config.handshake_timeout, exchange(stream))
        .await
        .map_err(|_| {
            warn!("Handshake timed out after {:?}", config.handshake_timeout);
            SdbError::Timeout
        })??;

    info!("Handshake successful");
    Ok(())
}

async fn exchange<S>(stream: &mut S) -> SdbResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(HANDSHAKE).await?;
    stream.flush().await?;

    let mut buf = vec![0u8; HANDSHAKE.len()];
    stream.read_exact(&mut buf).await?;

    if buf != HANDSHAKE {
        warn!("Invalid handshake response: {:?}", String::from_utf8_lossy(&buf));
        return Err(SdbError::InvalidHandshake);
    }
    Ok(())
}

/// Connect to an agent listening at `addr`
pub async fn connect<A>(addr: A, config: &ConnectionConfig) -> SdbResult<TcpStream>
where
    A: ToSocketAddrs,
{
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    info!("Connected to agent at {}", stream.peer_addr()?);

    handshake(&mut stream, config).await?;
    Ok(stream)
}

/// Wait for an agent to connect to `listener`
pub async fn accept(
    listener: &TcpListener,
    config: &ConnectionConfig,
) -> SdbResult<(TcpStream, SocketAddr)> {
    info!("Waiting for agent on {}", listener.local_addr()?);

    let (mut stream, peer) = listener.accept().await?;
    stream.set_nodelay(true)?;
    info!("Agent connected from {}", peer);

    handshake(&mut stream, config).await?;
    Ok((stream, peer))
}
