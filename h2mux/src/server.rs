//! Server implementation of h2mux.

// Some code are ported from hyper (licensed under MIT):
// https://github.com/hyperium/hyper/blob/f9f65b7aa67fa3ec0267fe015945973726285bc2/src/proto/h2/server.rs

use std::future::poll_fn;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use h2::server::SendResponse;
use http::request::Parts;
use http::Response;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use crate::stream::RecvBody;

/// Server H/2 connection that wraps underlying I/O resource.
pub struct Connection<IO: AsyncRead + AsyncWrite + Unpin> {
    conn: h2::server::Connection<IO, Bytes>,
}

/// Intermediary struct for answering an accepted request (i.e. sub-stream).
pub struct Accept {
    pub body: RecvBody,
    respond: SendResponse<Bytes>,
}

/// Builder of server [`Connection`] with custom configurations.
#[derive(Clone, Debug, Default)]
pub struct Builder {
    proto_builder: h2::server::Builder,
}

impl<IO: AsyncRead + AsyncWrite + Unpin> Connection<IO> {
    /// Accept a new request (i.e. sub-stream), wrapping `poll_accept` inside.
    pub async fn accept(&mut self) -> Option<Result<(Parts, Accept), crate::Error>> {
        poll_fn(|cx: &mut Context<'_>| self.poll_accept(cx)).await
    }

    /// Poll for a new request (i.e. sub-stream), as well as driving the whole `Connection` for progress.
    pub fn poll_accept(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<(Parts, Accept), crate::Error>>> {
        match ready!(self.conn.poll_accept(cx)) {
            Some(Ok((request, respond))) => {
                let (head, recv_stream) = request.into_parts();
                trace!(method = %head.method, uri = %head.uri, "stream accepted");
                Poll::Ready(Some(Ok((
                    head,
                    Accept {
                        body: RecvBody::new(recv_stream),
                        respond,
                    },
                ))))
            }
            Some(Err(e)) => Poll::Ready(Some(Err(e.into()))),
            None => {
                // no more incoming streams...
                trace!("incoming connection complete");
                Poll::Ready(None)
            }
        }
    }
}

impl Accept {
    /// Answer the request with a response head followed by a complete body.
    ///
    /// An empty `body` ends the stream together with the head.
    pub fn respond(mut self, response: Response<()>, body: Bytes) -> Result<(), crate::Error> {
        if body.is_empty() {
            self.respond.send_response(response, true)?;
            return Ok(());
        }
        let mut send_stream = self.respond.send_response(response, false)?;
        send_stream.send_data(body, true)?;
        Ok(())
    }

    /// Reject the request with a custom response.
    ///
    /// The response is sent with a end-of-stream mark.
    pub fn reject(mut self, response: Response<()>) -> Result<(), crate::Error> {
        self.respond.send_response(response, true)?;
        Ok(())
    }
}

impl Builder {
    /// Create a builder from a h2 builder.
    pub fn new(proto_builder: h2::server::Builder) -> Self {
        Self { proto_builder }
    }

    /// Perform h2 handshake over an I/O resource (typically a TLS stream).
    pub async fn handshake<IO: AsyncRead + AsyncWrite + Unpin>(
        &self,
        io: IO,
    ) -> Result<Connection<IO>, crate::Error> {
        let conn = self.proto_builder.handshake(io).await?;
        Ok(Connection { conn })
    }
}

/// Perform h2 handshake over an I/O resource (typically a TLS stream).
///
/// It is a shortcut for [`Builder::handshake`] with default configs.
pub async fn handshake<IO: AsyncRead + AsyncWrite + Unpin>(
    io: IO,
) -> Result<Connection<IO>, crate::Error> {
    Builder::default().handshake(io).await
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::{Request, StatusCode};
    use tokio::io::{duplex, AsyncReadExt};

    use crate::client;

    #[tokio::test]
    async fn reject_ends_stream() {
        let (client_io, server_io) = duplex(16 * 1024);
        tokio::spawn(async move {
            let mut conn = handshake(server_io).await.unwrap();
            while let Some(Ok((_, accept))) = conn.accept().await {
                accept
                    .reject(Response::builder().status(StatusCode::FORBIDDEN).body(()).unwrap())
                    .unwrap();
            }
        });

        let (mut control, connection) = client::handshake(client_io).await.unwrap();
        tokio::spawn(connection);
        for _ in 0..2 {
            let request = Request::get("https://example.com/").body(()).unwrap();
            let stream = control.open_stream(request, true).await.unwrap();
            let (head, mut body) = stream.response().await.unwrap();
            assert_eq!(head.status, StatusCode::FORBIDDEN);
            let mut buf = Vec::new();
            body.read_to_end(&mut buf).await.unwrap();
            assert!(buf.is_empty());
        }
    }
}
