// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! WebSocket framing adapted to stream semantics.
//!
//! The SSH layer expects an ordered byte stream; a WebSocket connection
//! carries discrete messages. [`WsStream`] bridges the two:
//!
//! - reads drain one binary frame at a time into a carry-over buffer, so
//!   callers may read in arbitrary chunk sizes across frame boundaries;
//! - each write emits exactly one binary frame carrying the whole buffer,
//!   with no coalescing; SSH already batches above this layer;
//! - a close frame from the peer, or the end of the message stream, is
//!   surfaced as EOF; shutdown performs the WebSocket closing handshake;
//! - any non-binary data frame is a protocol violation and fails the read.

use anyhow::{Context as _, Result};
use bytes::{Bytes, BytesMut};
use futures_util::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

/// Perform the client side of the HTTP upgrade over an established stream
/// and wrap the result as a byte stream.
pub async fn connect<S>(url: &str, stream: S) -> Result<WsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (inner, _response) = tokio_tungstenite::client_async(url, stream)
        .await
        .with_context(|| format!("WebSocket upgrade to {url} failed"))?;
    Ok(WsStream::new(inner))
}

/// Accept the server side of the HTTP upgrade, rejecting any request whose
/// path differs from the configured one.
pub async fn accept<S>(stream: S, path: &str) -> Result<WsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let expected = path.to_string();
    let inner = tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, resp: Response| {
        if req.uri().path() == expected {
            Ok(resp)
        } else {
            let mut denied = ErrorResponse::new(Some("not found".to_string()));
            *denied.status_mut() = StatusCode::NOT_FOUND;
            Err(denied)
        }
    })
    .await
    .context("WebSocket upgrade handshake failed")?;
    Ok(WsStream::new(inner))
}

/// A WebSocket connection presented as an ordered byte stream.
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    /// Bytes of the current frame not yet consumed by the reader.
    read_buf: BytesMut,
    read_closed: bool,
    /// A frame was queued on the sink and not flushed yet. Flushing happens
    /// before the next frame is accepted, so a retried `poll_write` can
    /// never send the same buffer twice.
    needs_flush: bool,
}

impl<S> WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: BytesMut::new(),
            read_closed: false,
            needs_flush: false,
        }
    }

    fn poll_flush_frame(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.needs_flush {
            ready!(Pin::new(&mut self.inner).poll_flush(cx)).map_err(write_error)?;
            self.needs_flush = false;
        }
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.read_closed {
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    // Empty frames carry nothing; keep polling.
                    this.read_buf.extend_from_slice(&data);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    this.read_closed = true;
                }
                Some(Ok(_)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected websocket message type",
                    )));
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    this.read_closed = true;
                }
                Some(Err(e)) => return Poll::Ready(Err(read_error(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = self.get_mut();
        ready!(this.poll_flush_frame(cx))?;
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(write_error)?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(write_error)?;
        this.needs_flush = true;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_flush_frame(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_frame(cx))?;
        // Drives the closing handshake: a normal-closure frame goes out and
        // the sink is flushed. An already-closed connection is not an error.
        match ready!(Pin::new(&mut this.inner).poll_close(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(write_error(e))),
        }
    }
}

fn read_error(e: WsError) -> io::Error {
    match e {
        WsError::Io(e) => e,
        other => io::Error::other(other),
    }
}

fn write_error(e: WsError) -> io::Error {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::ErrorKind::BrokenPipe.into()
        }
        WsError::Io(e) => e,
        other => io::Error::other(other),
    }
}
