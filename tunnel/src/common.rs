use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncWrite};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// ALPN identifier of HTTP/2 over TLS
pub const H2: &[u8] = b"h2";
/// Protocols offered to upstreams, in order of preference
pub const SUPPORTED_PROTOCOLS: [&[u8]; 3] = [H2, b"http/1.1", b"http/1.0"];
/// Bound of every dial/handshake phase unless configured otherwise
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TLS_PORT: u16 = 443;

/// Byte stream usable as a transport by both the HTTP/1.x and HTTP/2 paths
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// Where a forwarded request is headed, as resolved by the proxy pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    /// Server name indication; the host is sent when absent
    pub servername: Option<String>,
    pub port: Option<u16>,
    pub proxy: Option<ProxyOptions>,
}

impl Destination {
    pub fn new(host: impl Into<String>) -> Self {
        Destination {
            host: host.into(),
            servername: None,
            port: None,
            proxy: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_servername(mut self, servername: impl Into<String>) -> Self {
        self.servername = Some(servername.into());
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyOptions) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn sni(&self) -> &str {
        self.servername.as_deref().unwrap_or(&self.host)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_TLS_PORT)
    }

    /// `host:port` as written in a CONNECT request line
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port())
    }
}

/// Kind of the intermediate forward proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    /// CONNECT-capable proxy reached over plain TCP
    Http,
    /// CONNECT-capable proxy reached over TLS
    Https,
    /// SOCKS proxy (no HTTP/2 support yet)
    Socks,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
            ProxyKind::Socks => "socks",
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyKind {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(ProxyKind::Http),
            "https" => Ok(ProxyKind::Https),
            "socks" | "socks5" | "socks4" => Ok(ProxyKind::Socks),
            _ => Err("unknown proxy kind, expected one of: http, https, socks"),
        }
    }
}

/// Upstream proxy the destination is reached through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyOptions {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    /// Value of the `Host` header forwarded to the proxy, i.e. the tunnel target
    pub target: String,
    /// Extra headers sent along with CONNECT
    pub headers: HeaderMap,
    /// `user:password` for basic proxy authorization
    pub auth: Option<String>,
}

impl ProxyOptions {
    pub fn new(kind: ProxyKind, host: impl Into<String>, port: u16, target: impl Into<String>) -> Self {
        ProxyOptions {
            kind,
            host: host.into(),
            port,
            target: target.into(),
            headers: HeaderMap::new(),
            auth: None,
        }
    }

    pub fn with_auth(mut self, auth: impl Into<String>) -> Self {
        self.auth = Some(auth.into());
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Outcome of a completed establishment attempt
pub enum Negotiated {
    /// TLS handshake selected `h2`
    Multiplexed(BoxedIo),
    /// TLS handshake completed with another (or no) protocol; the socket may be reused
    Downgraded(BoxedIo),
    /// The route cannot carry HTTP/2 at all (SOCKS)
    Unsupported,
}

impl Negotiated {
    pub fn is_multiplexed(&self) -> bool {
        matches!(self, Negotiated::Multiplexed(_))
    }
}

impl fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Negotiated::Multiplexed(_) => f.write_str("Multiplexed"),
            Negotiated::Downgraded(_) => f.write_str("Downgraded"),
            Negotiated::Unsupported => f.write_str("Unsupported"),
        }
    }
}
