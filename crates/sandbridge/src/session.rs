//! Relay between an editor connection and a language server transport.
//!
//! Messages are decoded with [`LspCodec`] in both directions. File URIs in
//! messages from the editor are rewritten to the server's virtual paths and
//! URIs in messages from the server are rewritten back to host paths.

use crate::codec::LspCodec;
use crate::transport::Transport;
use futures::{SinkExt, StreamExt};
use sandbridge_core::{Direction, PathTranslator, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

/// How long replies are still relayed after the editor closed its input.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters for a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Messages sent from the editor to the server.
    pub to_server: u64,
    /// Messages sent from the server to the editor.
    pub to_client: u64,
}

/// Relays messages until the session ends, then closes the transport.
///
/// The session ends when the server closes its output. When the editor
/// closes its input first, the server's input is closed too and replies
/// still in flight are relayed for up to [`DRAIN_TIMEOUT`].
pub async fn relay<R, W>(
    mut transport: Transport,
    translator: &PathTranslator,
    client_reader: R,
    client_writer: W,
) -> Result<RelayStats>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stats = RelayStats::default();
    let result = {
        let (server_reader, server_writer) = transport.split_mut();

        let upstream = pump(
            FramedRead::new(client_reader, LspCodec::new()),
            FramedWrite::new(server_writer, LspCodec::new()),
            translator,
            Direction::ToVirtual,
            &mut stats.to_server,
        );
        let downstream = pump(
            FramedRead::new(server_reader, LspCodec::new()),
            FramedWrite::new(client_writer, LspCodec::new()),
            translator,
            Direction::ToHost,
            &mut stats.to_client,
        );
        tokio::pin!(upstream, downstream);

        let (editor_closed, done) = tokio::select! {
            done = &mut upstream => (true, done),
            done = &mut downstream => (false, done),
        };

        match (editor_closed, done) {
            (true, Ok(())) => {
                tracing::debug!("editor closed its input, draining server replies");
                match tokio::time::timeout(DRAIN_TIMEOUT, &mut downstream).await {
                    Ok(done) => done,
                    Err(_) => {
                        tracing::warn!("server did not close its output in time");
                        Ok(())
                    }
                }
            }
            (_, done) => done,
        }
    };

    let closed = transport.close().await;
    result?;
    closed?;
    tracing::info!(
        to_server = stats.to_server,
        to_client = stats.to_client,
        "session ended"
    );
    Ok(stats)
}

async fn pump<R, W>(
    mut source: FramedRead<R, LspCodec>,
    mut sink: FramedWrite<W, LspCodec>,
    translator: &PathTranslator,
    direction: Direction,
    count: &mut u64,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(message) = source.next().await {
        let mut message = message?;
        let rewritten = translator.rewrite_uris(&mut message, direction);
        tracing::trace!(?direction, rewritten, "relaying message");
        sink.send(message).await?;
        *count += 1;
    }
    // Passes the EOF on to the other side.
    sink.close().await?;
    Ok(())
}
