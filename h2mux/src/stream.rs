// Partially ported from hyper (licensed under MIT):
// https://github.com/hyperium/hyper/blob/f9f65b7aa67fa3ec0267fe015945973726285bc2/src/proto/h2/mod.rs

use bytes::{Buf, Bytes};
use h2::{Reason, RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::trace;

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use crate::utils::h2_to_io_error;

/// Size of chunks read from a request body before being framed as DATA
const BODY_CHUNK_SIZE: usize = 16 * 1024;

/// Body of a stream received over HTTP/2, readable as a plain byte stream
pub struct RecvBody {
    recv_stream: RecvStream,
    buf: Bytes,
}

impl RecvBody {
    pub fn new(recv_stream: RecvStream) -> Self {
        RecvBody {
            recv_stream,
            buf: Bytes::new(),
        }
    }

    /// Whether the peer has finished sending and nothing is left buffered
    pub fn is_end_stream(&self) -> bool {
        self.buf.is_empty() && self.recv_stream.is_end_stream()
    }
}

impl AsyncRead for RecvBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        read_buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), io::Error>> {
        let Self { buf, recv_stream } = self.get_mut();
        if buf.is_empty() {
            *buf = loop {
                match ready!(recv_stream.poll_data(cx)) {
                    None => return Poll::Ready(Ok(())),
                    Some(Ok(buf)) if buf.is_empty() && !recv_stream.is_end_stream() => continue,
                    Some(Ok(buf)) => break buf,
                    Some(Err(e)) => {
                        return Poll::Ready(match e.reason() {
                            Some(Reason::NO_ERROR) | Some(Reason::CANCEL) => Ok(()),
                            Some(Reason::STREAM_CLOSED) => {
                                Err(io::Error::new(io::ErrorKind::BrokenPipe, e))
                            }
                            _ => Err(h2_to_io_error(e)),
                        })
                    }
                }
            };
        }
        let cnt = std::cmp::min(buf.len(), read_buf.remaining());
        read_buf.put_slice(&buf[..cnt]);
        buf.advance(cnt);
        let _ = recv_stream.flow_control().release_capacity(cnt);
        Poll::Ready(Ok(()))
    }
}

/// Pipe `body` into a stream as DATA frames and end the stream once `body` is exhausted.
///
/// Returns the number of bytes sent.
pub async fn send_body<R: AsyncRead + Unpin>(
    send_stream: &mut SendStream<Bytes>,
    mut body: R,
) -> io::Result<u64> {
    let mut buf = vec![0u8; BODY_CHUNK_SIZE];
    let mut total = 0;
    loop {
        let n = body.read(&mut buf).await?;
        if n == 0 {
            send_stream
                .send_data(Bytes::new(), true)
                .map_err(h2_to_io_error)?;
            trace!(total, "request body sent");
            return Ok(total);
        }
        let mut chunk = Bytes::copy_from_slice(&buf[..n]);
        while !chunk.is_empty() {
            send_stream.reserve_capacity(chunk.len());
            // Errors from `poll_capacity` are ignored in favor of the reason from `poll_reset`.
            let capacity = poll_fn(|cx| send_stream.poll_capacity(cx)).await;
            let cnt = match capacity {
                Some(Ok(cnt)) => cnt,
                None | Some(Err(_)) => return Err(stream_reset(send_stream).await),
            };
            if cnt == 0 {
                continue;
            }
            let data = chunk.split_to(cnt.min(chunk.len()));
            send_stream.send_data(data, false).map_err(h2_to_io_error)?;
        }
        total += n as u64;
    }
}

async fn stream_reset(send_stream: &mut SendStream<Bytes>) -> io::Error {
    let reset = poll_fn(|cx| send_stream.poll_reset(cx)).await;
    match reset {
        Ok(Reason::NO_ERROR) | Ok(Reason::CANCEL) | Ok(Reason::STREAM_CLOSED) => {
            io::ErrorKind::BrokenPipe.into()
        }
        Ok(reason) => h2_to_io_error(reason.into()),
        Err(e) => h2_to_io_error(e),
    }
}
