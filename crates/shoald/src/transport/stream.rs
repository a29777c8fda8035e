//! Length-framed stream transport.
//!
//! A connection carries exactly one message: a 2-byte big-endian length,
//! that many bytes of encoded [`StreamEnvelope`], then an optional raw body
//! that runs until the writer closes. Short reads, malformed envelopes and
//! writers that never close fail that one connection; the listener keeps
//! accepting.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use shoal_core::error::{ClusterError, Result};
use shoal_core::wire::{
    decode_frame_body, encode_frame, frame_len, Event, StreamEnvelope, WireError,
    FRAME_HEADER_LEN,
};

use crate::dispatch::EventDispatcher;

/// One decoded stream message.
#[derive(Debug)]
pub struct StreamMessage {
    pub event: Event,
    pub sequence: u64,
    pub body: Option<Bytes>,
}

/// Read a single framed message (and any trailing body) from `reader`.
pub async fn read_message<R>(reader: &mut R, max_body: usize) -> Result<StreamMessage>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let mut frame = vec![0u8; frame_len(header)];
    reader.read_exact(&mut frame).await?;
    let envelope = decode_frame_body(&frame)?;
    let sequence = envelope.sequence;
    let event = envelope.into_event()?;

    let mut body = Vec::new();
    reader
        .take(max_body as u64 + 1)
        .read_to_end(&mut body)
        .await?;
    if body.len() > max_body {
        return Err(ClusterError::Wire(WireError::TooLarge {
            len: body.len(),
            max: max_body,
        }));
    }

    Ok(StreamMessage {
        event,
        sequence,
        body: (!body.is_empty()).then(|| Bytes::from(body)),
    })
}

/// [`read_message`], giving up if the whole message has not arrived in `limit`.
pub async fn read_message_within<R>(reader: &mut R, max_body: usize, limit: Duration) -> Result<StreamMessage>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(limit, read_message(reader, max_body)).await {
        Ok(result) => result,
        Err(_) => Err(ClusterError::Transport(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("stream not closed within {limit:?}"),
        ))),
    }
}

/// Open a stream to `host:port`, send one framed event and an optional body.
pub async fn unicast_stream(
    event: &Event,
    sequence: u64,
    host: &str,
    port: u16,
    body: Option<Bytes>,
) -> anyhow::Result<()> {
    let frame = encode_frame(&StreamEnvelope::from_event(event, sequence)?)?;

    let mut stream = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("failed to connect to {host}:{port}"))?;
    stream.write_all(&frame).await.context("failed to write frame")?;
    if let Some(body) = body {
        stream.write_all(&body).await.context("failed to write body")?;
    }
    stream.shutdown().await.context("failed to close stream")?;
    Ok(())
}

/// Accept framed messages until shutdown.
pub async fn stream_loop(
    listener: TcpListener,
    dispatcher: Arc<EventDispatcher>,
    max_body: usize,
    read_timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "stream listener starting");
    }

    loop {
        let (mut socket, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(a) => a,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
            _ = shutdown.recv() => {
                tracing::info!("stream listener stopped");
                return;
            }
        };

        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            match read_message_within(&mut socket, max_body, read_timeout).await {
                Ok(message) => handle_message(&dispatcher, peer, message),
                Err(e) => tracing::debug!(%peer, error = %e, "dropping bad stream"),
            }
        });
    }
}

fn handle_message(dispatcher: &EventDispatcher, peer: SocketAddr, message: StreamMessage) {
    tracing::trace!(
        %peer,
        event = message.event.kind(),
        sequence = message.sequence,
        body = message.body.as_ref().map_or(0, |b| b.len()),
        "stream message"
    );
    dispatcher.dispatch(peer, &message.event);
}
