//! Client implementation of h2mux.

// Some code are ported from hyper (licensed under MIT):
// https://github.com/hyperium/hyper/blob/f9f65b7aa67fa3ec0267fe015945973726285bc2/src/proto/h2/mod.rs

use bytes::Bytes;
use h2::client::{ResponseFuture, SendRequest};
use h2::SendStream;
use http::header::{HeaderName, CONNECTION, HOST, TE, TRANSFER_ENCODING, UPGRADE};
use http::response::Parts;
use http::{HeaderMap, Request};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::stream::RecvBody;

/// Client H/2 connection that wraps underlying I/O resource.
///
/// It must be polled (typically in a spawned task) for any stream to make progress. It resolves
/// once the peer closes the connection, the I/O fails or all [`Control`]s are dropped.
pub struct Connection<IO: AsyncRead + AsyncWrite + Unpin> {
    conn: h2::client::Connection<IO, Bytes>,
}

/// Handle for opening streams on a client connection, cheap to clone.
#[derive(Clone)]
pub struct Control {
    send_request: SendRequest<Bytes>,
}

/// Builder of client [`Connection`] with custom configurations.
#[derive(Clone, Debug)]
pub struct Builder {
    proto_builder: h2::client::Builder,
}

/// Stream opened for a request whose response head has not arrived yet
pub struct InFlightStream {
    send_stream: Option<SendStream<Bytes>>,
    response: ResponseFuture,
}

impl<IO: AsyncRead + AsyncWrite + Unpin> Future for Connection<IO> {
    type Output = Result<(), crate::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.conn).poll(cx).map_err(|e| e.into())
    }
}

impl Control {
    /// Open a new stream for `request`, waiting for the peer to allow one more stream.
    ///
    /// If `end_of_stream` is set, the request carries no body.
    pub async fn open_stream(
        &mut self,
        request: Request<()>,
        end_of_stream: bool,
    ) -> Result<InFlightStream, crate::Error> {
        poll_fn(|cx: &mut Context<'_>| self.send_request.poll_ready(cx)).await?;
        let (response, send_stream) = self.send_request.send_request(request, end_of_stream)?;
        trace!(
            stream_id = ?send_stream.stream_id(),
            end_of_stream,
            "stream opened"
        );
        Ok(InFlightStream {
            send_stream: (!end_of_stream).then_some(send_stream),
            response,
        })
    }
}

impl InFlightStream {
    /// Take the sending half to pipe a request body through it.
    ///
    /// `None` if the stream was opened with end-of-stream or the half is already taken.
    pub fn take_send_stream(&mut self) -> Option<SendStream<Bytes>> {
        self.send_stream.take()
    }

    /// Wait for the response head.
    pub async fn response(self) -> Result<(Parts, RecvBody), crate::Error> {
        let (head, recv_stream) = self.response.await?.into_parts();
        debug!(status = head.status.as_u16(), "response received");
        Ok((head, RecvBody::new(recv_stream)))
    }
}

impl Default for Builder {
    fn default() -> Self {
        let mut proto_builder = h2::client::Builder::new();
        proto_builder.enable_push(false);
        Self { proto_builder }
    }
}

impl Builder {
    /// Create a builder from a h2 builder.
    ///
    /// Push is disabled regardless of the builder passed in.
    pub fn new(mut proto_builder: h2::client::Builder) -> Self {
        proto_builder.enable_push(false);
        Self { proto_builder }
    }

    /// Perform the HTTP/2 handshake over an I/O resource (typically a TLS stream).
    pub async fn handshake<IO: AsyncRead + AsyncWrite + Unpin>(
        &self,
        io: IO,
    ) -> Result<(Control, Connection<IO>), crate::Error> {
        let (send_request, conn) = self.proto_builder.handshake::<_, Bytes>(io).await?;
        debug!("h2 handshaked");
        Ok((Control { send_request }, Connection { conn }))
    }
}

/// Perform the HTTP/2 handshake over an I/O resource with default configs.
pub async fn handshake<IO: AsyncRead + AsyncWrite + Unpin>(
    io: IO,
) -> Result<(Control, Connection<IO>), crate::Error> {
    Builder::default().handshake(io).await
}

/// Remove headers that are connection-specific in HTTP/1.x and forbidden in HTTP/2.
///
/// Headers named by `Connection` go as well. `Host` is dropped since `:authority` carries it.
/// `TE` survives only as `trailers`.
pub fn strip_connection_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }

    for name in [CONNECTION, TRANSFER_ENCODING, UPGRADE, HOST] {
        headers.remove(name);
    }
    for name in ["keep-alive", "proxy-connection", "http2-settings"] {
        headers.remove(name);
    }

    if headers
        .get(TE)
        .map_or(false, |te| te.as_bytes() != b"trailers")
    {
        headers.remove(TE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::{HeaderValue, Method, Response, StatusCode};
    use tokio::io::{duplex, AsyncReadExt};

    use std::time::Duration;

    use crate::server;
    use crate::stream::send_body;

    #[test]
    fn strip_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-hop"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-hop", HeaderValue::from_static("1"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("http2-settings", HeaderValue::from_static("AAMAAABkAAQAAP__"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(HOST, HeaderValue::from_static("example.com"));
        headers.insert(TE, HeaderValue::from_static("gzip"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        strip_connection_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["accept"], "*/*");

        let mut headers = HeaderMap::new();
        headers.insert(TE, HeaderValue::from_static("trailers"));
        strip_connection_headers(&mut headers);
        assert_eq!(headers[TE], "trailers");
    }

    #[tokio::test]
    async fn request_and_response_over_duplex() {
        let (client_io, server_io) = duplex(64 * 1024);

        let server = tokio::spawn(async move {
            let mut conn = server::handshake(server_io).await.unwrap();
            let (head, mut accept) = conn.accept().await.unwrap().unwrap();
            let mut body = Vec::new();
            // the connection has to be driven while the body is read
            let drive = async {
                accept.body.read_to_end(&mut body).await.unwrap();
                accept
                    .respond(
                        Response::builder().status(StatusCode::CREATED).body(()).unwrap(),
                        Bytes::from_static(b"pong"),
                    )
                    .unwrap();
            };
            tokio::select! {
                _ = drive => {}
                _ = conn.accept() => panic!("unexpected second stream"),
            }
            let _ = conn.accept().await;
            (head, body)
        });

        let (mut control, connection) = handshake(client_io).await.unwrap();
        tokio::spawn(connection);
        let request = Request::builder()
            .method(Method::POST)
            .uri("https://example.com/upload")
            .body(())
            .unwrap();
        let mut stream = control.open_stream(request, false).await.unwrap();
        let mut send_stream = stream.take_send_stream().unwrap();
        tokio::spawn(async move { send_body(&mut send_stream, &b"ping"[..]).await });
        let (head, mut body) = stream.response().await.unwrap();
        assert_eq!(head.status, StatusCode::CREATED);
        let mut buf = Vec::new();
        body.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"pong");
        assert!(body.is_end_stream());

        // the connection only closes once no stream or handle refers to it
        drop(body);
        drop(control);
        let (head, received) = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server side never saw the connection close")
            .unwrap();
        assert_eq!(head.method, Method::POST);
        assert_eq!(head.uri.path(), "/upload");
        assert_eq!(head.uri.authority().unwrap().as_str(), "example.com");
        assert_eq!(received, b"ping");
    }
}
