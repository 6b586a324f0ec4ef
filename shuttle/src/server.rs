//! TLS listening server that speaks h2 alongside HTTP/1.x when allowed to.

use anyhow::{Context, Result};
use async_trait::async_trait;
use http::request::Parts;
use rustls::{Certificate, PrivateKey, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace, warn};

use std::net::SocketAddr;
use std::sync::Arc;

use alpn_tunnel::H2;

use crate::config::Config;
use crate::utils::DurationExt;

const HTTP11: &[u8] = b"http/1.1";

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Whether clients unable to speak h2 may still connect
    pub allow_http1: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions { allow_http1: true }
    }
}

/// Protocols offered to clients via ALPN
///
/// h2 is only offered when it is enabled globally and HTTP/1.x stays allowed as a fallback.
pub fn alpn_protocols(enable_h2: bool, options: &ServerOptions) -> Vec<Vec<u8>> {
    if enable_h2 && options.allow_http1 {
        vec![H2.to_vec(), HTTP11.to_vec()]
    } else {
        vec![HTTP11.to_vec()]
    }
}

/// Connection accepted over TLS, split by the negotiated protocol
pub enum Inbound<IO: AsyncRead + AsyncWrite + Unpin> {
    Http1(TlsStream<IO>),
    H2(h2mux::server::Connection<TlsStream<IO>>),
}

pub struct TlsServer {
    acceptor: TlsAcceptor,
}

impl TlsServer {
    pub fn new(
        config: &Config,
        options: &ServerOptions,
        certs: Vec<Certificate>,
        key: PrivateKey,
    ) -> Result<Self> {
        let mut tlsconf = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("invalid server certificate or key")?;
        tlsconf.alpn_protocols = alpn_protocols(config.enable_h2, options);
        Ok(TlsServer {
            acceptor: TlsAcceptor::from(Arc::new(tlsconf)),
        })
    }

    /// Accept TLS on `io` and start h2 on top if the client selected it.
    pub async fn accept<IO: AsyncRead + AsyncWrite + Unpin>(&self, io: IO) -> Result<Inbound<IO>> {
        let stream = self
            .acceptor
            .accept(io)
            .await
            .context("tls handshake with client failed")?;
        if stream.get_ref().1.alpn_protocol() == Some(H2) {
            let conn = h2mux::server::handshake(stream)
                .await
                .context("h2 handshake with client failed")?;
            Ok(Inbound::H2(conn))
        } else {
            Ok(Inbound::Http1(stream))
        }
    }
}

/// Consumer of what a [`TlsServer`] accepts
#[async_trait]
pub trait RequestListener: Send + Sync + 'static {
    /// Serve a whole HTTP/1.x connection.
    async fn on_http1(&self, stream: TlsStream<TcpStream>, client_addr: SocketAddr);

    /// Serve one request received over h2.
    async fn on_request(
        &self,
        head: Parts,
        accept: h2mux::server::Accept,
        client_addr: SocketAddr,
    );
}

pub async fn serve<L: RequestListener>(
    listener: TcpListener,
    server: TlsServer,
    request_listener: L,
) -> Result<()> {
    let server = Arc::new(server);
    let request_listener = Arc::new(request_listener);
    info!("tls server listening on {}", listener.local_addr()?);
    while let Ok((inbound, client_addr)) = listener.accept().await {
        debug!("accepting connection from {}", &client_addr);
        let server = server.clone();
        let request_listener = request_listener.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(inbound, client_addr, server, request_listener).await
            {
                warn!(error = %format!("{:#}", e), "failed to serve {}", &client_addr)
            }
        });
    }
    Ok(())
}

async fn handle_connection<L: RequestListener>(
    inbound: TcpStream,
    client_addr: SocketAddr,
    server: Arc<TlsServer>,
    request_listener: Arc<L>,
) -> Result<()> {
    let t = Instant::now();
    match server.accept(inbound).await? {
        Inbound::Http1(stream) => {
            trace!(client = %client_addr, "serving http/1.x");
            request_listener.on_http1(stream, client_addr).await;
        }
        Inbound::H2(mut conn) => {
            trace!(client = %client_addr, "serving h2");
            while let Some(accepted) = conn.accept().await {
                let (head, accept) = accepted.context("h2 connection with client failed")?;
                let request_listener = request_listener.clone();
                tokio::spawn(async move {
                    request_listener.on_request(head, accept, client_addr).await
                });
            }
        }
    }
    debug!(
        client = %client_addr,
        "connection closed after {}",
        t.elapsed().autofmt()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use http::{Method, Response, StatusCode};
    use tokio::sync::{mpsc, oneshot};

    use std::time::Duration;

    use alpn_tunnel::{BoxedIo, Destination, Establisher, Negotiated};

    use crate::request::{ForwardRequest, ResponseSink, UpstreamResponse};
    use crate::upgrade::{KeyState, Upgrader};

    fn self_signed() -> (Vec<Certificate>, PrivateKey) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
        (
            vec![Certificate(cert.serialize_der().unwrap())],
            PrivateKey(cert.serialize_private_key_der()),
        )
    }

    /// Upstream answering every h2 request with 204, reporting how each connection was accepted
    async fn upstream(options: ServerOptions) -> (SocketAddr, mpsc::UnboundedReceiver<&'static str>) {
        let (certs, key) = self_signed();
        let server = TlsServer::new(&Config::default(), &options, certs, key).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                match server.accept(sock).await {
                    Ok(Inbound::H2(mut conn)) => {
                        let _ = accepted_tx.send("h2");
                        tokio::spawn(async move {
                            while let Some(Ok((_, accept))) = conn.accept().await {
                                let response = Response::builder()
                                    .status(StatusCode::NO_CONTENT)
                                    .body(())
                                    .unwrap();
                                let _ = accept.respond(response, Bytes::new());
                            }
                        });
                    }
                    Ok(Inbound::Http1(_)) => {
                        let _ = accepted_tx.send("http/1.1");
                    }
                    Err(_) => {
                        let _ = accepted_tx.send("failed");
                    }
                }
            }
        });
        (addr, accepted_rx)
    }

    fn local(addr: SocketAddr) -> Destination {
        Destination::new("127.0.0.1")
            .with_servername("localhost")
            .with_port(addr.port())
    }

    #[test]
    fn h2_offered_only_with_http1_fallback() {
        let fallback = ServerOptions { allow_http1: true };
        let strict = ServerOptions { allow_http1: false };
        assert_eq!(
            alpn_protocols(true, &fallback),
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
        assert_eq!(alpn_protocols(true, &strict), vec![b"http/1.1".to_vec()]);
        assert_eq!(alpn_protocols(false, &fallback), vec![b"http/1.1".to_vec()]);
        assert_eq!(alpn_protocols(false, &strict), vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn bogus_key_is_rejected() {
        let r = TlsServer::new(
            &Config::default(),
            &ServerOptions::default(),
            vec![Certificate(b"not a certificate".to_vec())],
            PrivateKey(b"not a key".to_vec()),
        );
        assert!(r.is_err());
    }

    #[tokio::test]
    async fn accept_splits_by_negotiated_protocol() {
        let establisher = Establisher::new(Duration::from_secs(5));

        let (addr, mut accepted) = upstream(ServerOptions::default()).await;
        let _control = match establisher.connect(&local(addr)).await.unwrap() {
            Negotiated::Multiplexed(io) => {
                let (control, connection) = h2mux::client::handshake(io).await.unwrap();
                tokio::spawn(connection);
                control
            }
            negotiated => panic!("h2 not negotiated: {:?}", negotiated),
        };
        assert_eq!(accepted.recv().await, Some("h2"));

        let (addr, mut accepted) = upstream(ServerOptions { allow_http1: false }).await;
        let negotiated = establisher.connect(&local(addr)).await.unwrap();
        assert!(matches!(negotiated, Negotiated::Downgraded(_)));
        assert_eq!(accepted.recv().await, Some("http/1.1"));
    }

    #[tokio::test]
    async fn upgrader_reaches_tls_upstream_over_h2() {
        let (addr, mut accepted) = upstream(ServerOptions::default()).await;
        let upgrader = Upgrader::new(Config::default());
        let dest = local(addr);

        let (response_tx, response_rx) = oneshot::channel::<UpstreamResponse>();
        let (fallback_tx, mut fallback_rx) = oneshot::channel::<()>();
        let request = ForwardRequest::new(1, Method::GET, "/").with_destination(dest.clone());
        upgrader
            .forward(
                request,
                Box::new(response_tx),
                Box::new(
                    move |_: ForwardRequest, _: Box<dyn ResponseSink>, _: Option<BoxedIo>| {
                        let _ = fallback_tx.send(());
                    },
                ),
            )
            .await;

        let response = response_rx.await.unwrap();
        assert_eq!(response.status, StatusCode::NO_CONTENT);
        assert!(fallback_rx.try_recv().is_err());
        assert_eq!(accepted.recv().await, Some("h2"));
        assert_eq!(upgrader.state(1, &dest), KeyState::Negotiated);
    }
}
