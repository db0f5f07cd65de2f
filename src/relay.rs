//! Bidirectional byte relay between a client and the upstream.

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Bytes forwarded in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Pump bytes both ways until either direction reaches end-of-stream or
/// fails, then close both sockets.
///
/// The first direction to end tears the session down: the other direction is
/// stopped and both write sides are shut down, so a peer that stays idle after
/// its counterpart left still sees the closure.
pub async fn relay<C, U>(client: C, upstream: U, buffer_size: usize) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_reader, mut client_writer) = io::split(client);
    let (mut upstream_reader, mut upstream_writer) = io::split(upstream);
    let mut client_to_upstream = 0u64;
    let mut upstream_to_client = 0u64;

    tokio::select! {
        _ = pump(
            &mut client_reader,
            &mut upstream_writer,
            buffer_size,
            &mut client_to_upstream,
            "client->upstream",
        ) => {}
        _ = pump(
            &mut upstream_reader,
            &mut client_writer,
            buffer_size,
            &mut upstream_to_client,
            "upstream->client",
        ) => {}
    }

    close_write(&mut upstream_writer, "upstream").await;
    close_write(&mut client_writer, "client").await;

    RelayStats {
        client_to_upstream,
        upstream_to_client,
    }
}

async fn pump<R, W>(
    source: &mut R,
    target: &mut W,
    buffer_size: usize,
    forwarded: &mut u64,
    direction: &'static str,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; buffer_size.max(1)];

    loop {
        let read = match source.read(&mut buffer).await {
            Ok(0) => {
                debug!("{} reached end of stream", direction);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("{} relay stopped: {}", direction, e);
                return;
            }
        };

        let written = async {
            target.write_all(&buffer[..read]).await?;
            target.flush().await
        };
        if let Err(e) = written.await {
            debug!("{} relay stopped: {}", direction, e);
            return;
        }
        *forwarded += read as u64;
    }
}

async fn close_write<W: AsyncWrite + Unpin>(target: &mut W, side: &'static str) {
    if let Err(e) = target.shutdown().await {
        trace!("Ignoring {} close error: {}", side, e);
    }
}
