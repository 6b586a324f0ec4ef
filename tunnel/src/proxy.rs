//! Reaching upstreams through forward proxies.

use base64::Engine;
use http::header::{HOST, PROXY_AUTHORIZATION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::common::{BoxedIo, ProxyKind, ProxyOptions};
use crate::error::Error;
use crate::utils::server_name;

/// Maximum size of the response head a proxy may answer CONNECT with
const MAX_RESPONSE_HEAD_SIZE: usize = 8192;

/// Open a connection to an HTTP(S) forward proxy and turn it into a raw pipe to the target.
pub async fn connect_tunnel(proxy: &ProxyOptions, proxy_tls: &TlsConnector) -> Result<BoxedIo, Error> {
    let tcp = TcpStream::connect(proxy.addr()).await?;
    let mut conn: BoxedIo = match proxy.kind {
        ProxyKind::Https => {
            let name = server_name(&proxy.host)?;
            Box::new(proxy_tls.connect(name, tcp).await?)
        }
        _ => Box::new(tcp),
    };
    tunnel(&mut conn, proxy).await?;
    Ok(conn)
}

/// Issue CONNECT on an open proxy connection and wait for a 200.
pub async fn tunnel<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut S,
    proxy: &ProxyOptions,
) -> Result<(), Error> {
    let req = connect_request(proxy);
    trace!(
        proxy = %proxy.addr(),
        "sending: {:?}",
        String::from_utf8_lossy(&req)
    );
    conn.write_all(&req).await?;
    conn.flush().await?;

    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::TunnelBroken("unexpected eof while tunneling"));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(&buf) {
            Ok(httparse::Status::Complete(_)) => {
                let status = res.code.unwrap_or_default();
                debug!(proxy = %proxy.addr(), target = %proxy.target, status, "tunnel response");
                return if status == 200 {
                    Ok(())
                } else {
                    Err(Error::Tunnel { status })
                };
            }
            Ok(httparse::Status::Partial) if buf.len() < MAX_RESPONSE_HEAD_SIZE => continue,
            Ok(httparse::Status::Partial) => {
                return Err(Error::TunnelBroken("response head too large"))
            }
            Err(_) => return Err(Error::TunnelBroken("malformed response")),
        }
    }
}

fn connect_request(proxy: &ProxyOptions) -> Vec<u8> {
    let mut req = format!(
        "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n",
        proxy.target
    )
    .into_bytes();
    for (name, value) in proxy.headers.iter() {
        if name == HOST || (name == PROXY_AUTHORIZATION && proxy.auth.is_some()) {
            continue;
        }
        req.extend_from_slice(name.as_str().as_bytes());
        req.extend_from_slice(b": ");
        req.extend_from_slice(value.as_bytes());
        req.extend_from_slice(b"\r\n");
    }
    if let Some(ref auth) = proxy.auth {
        let encoded = base64::engine::general_purpose::STANDARD.encode(auth.as_bytes());
        req.extend_from_slice(format!("Proxy-Authorization: Basic {}\r\n", encoded).as_bytes());
    }
    req.extend_from_slice(b"\r\n");
    req
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::HeaderValue;
    use tokio::net::TcpListener;

    use std::net::SocketAddr;

    async fn mock_proxy(response: &'static [u8]) -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut end = 0;
            while !buf[..end].ends_with(b"\r\n\r\n") {
                let n = sock.read(&mut buf[end..]).await.unwrap();
                assert!(n > 0);
                end += n;
            }
            sock.write_all(response).await.unwrap();
            buf.truncate(end);
            buf
        });
        (addr, handle)
    }

    fn proxy_for(addr: SocketAddr) -> ProxyOptions {
        ProxyOptions::new(ProxyKind::Http, addr.ip().to_string(), addr.port(), "example.com:443")
    }

    #[tokio::test]
    async fn tunnel_established() {
        let (addr, server) = mock_proxy(b"HTTP/1.1 200 Connection Established\r\n\r\n").await;
        let mut proxy = proxy_for(addr).with_auth("user:pass");
        proxy
            .headers
            .insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        let conn = connect_tunnel(&proxy, &TlsConnector::from(crate::utils::proxy_tls_config()))
            .await;
        assert!(conn.is_ok());

        let sent = String::from_utf8(server.await.unwrap()).unwrap();
        assert!(sent.starts_with("CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n"));
        assert!(sent.contains("x-forwarded-for: 10.0.0.1\r\n"));
        assert!(sent.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[tokio::test]
    async fn tunnel_refused_with_status() {
        let (addr, _server) = mock_proxy(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n").await;
        let mut conn = TcpStream::connect(addr).await.unwrap();
        let err = tunnel(&mut conn, &proxy_for(addr)).await.unwrap_err();
        assert!(matches!(err, Error::Tunnel { status: 403 }));
        assert_eq!(err.code(), "ECONNRESET");
    }

    #[tokio::test]
    async fn tunnel_eof() {
        let (addr, _server) = mock_proxy(b"HTTP/1.1 200 OK").await;
        let mut conn = TcpStream::connect(addr).await.unwrap();
        let err = tunnel(&mut conn, &proxy_for(addr)).await.unwrap_err();
        assert!(matches!(err, Error::TunnelBroken(_)));
        assert!(!err.is_tls());
    }

    #[tokio::test]
    async fn tunnel_bad_response() {
        let (addr, _server) = mock_proxy(b"foo bar baz hallo\r\n\r\n").await;
        let mut conn = TcpStream::connect(addr).await.unwrap();
        let err = tunnel(&mut conn, &proxy_for(addr)).await.unwrap_err();
        assert!(matches!(err, Error::TunnelBroken("malformed response")));
    }
}
