use rustls::{ClientConfig, ServerName};

use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use crate::common::SUPPORTED_PROTOCOLS;
use crate::error::Error;

/// Accept whatever certificate upstreams present
///
/// The proxy intercepts traffic and never vouches for upstream identities.
pub struct NoCertificateVerification {}

impl rustls::client::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// TLS config for upstreams, offering `h2`, `http/1.1` and `http/1.0`
pub fn upstream_tls_config() -> Arc<ClientConfig> {
    let mut tlsconf = insecure_tls_config();
    tlsconf.alpn_protocols = SUPPORTED_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
    Arc::new(tlsconf)
}

/// TLS config for reaching an `https` forward proxy, which only speaks HTTP/1.1
pub fn proxy_tls_config() -> Arc<ClientConfig> {
    let mut tlsconf = insecure_tls_config();
    tlsconf.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(tlsconf)
}

fn insecure_tls_config() -> ClientConfig {
    ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification {}))
        .with_no_client_auth()
}

pub trait DurationExt {
    fn autofmt(&'_ self) -> DurationAutoFormatter<'_>;
}

impl DurationExt for Duration {
    fn autofmt(&'_ self) -> DurationAutoFormatter<'_> {
        DurationAutoFormatter(self)
    }
}

pub struct DurationAutoFormatter<'a>(pub &'a Duration);

impl<'a> Display for DurationAutoFormatter<'a> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.0.as_nanos();
        match t {
            t if t < 1000 => write!(fmt, "{}ns", t),
            t if t < 1_000_000 => write!(fmt, "{:.3}µs", t as f64 / 1e3),
            t if t < 1_000_000_000 => write!(fmt, "{:.3}ms", t as f64 / 1e6),
            t if t < 60_000_000_000 => write!(fmt, "{:.3}s", t as f64 / 1e9),
            t if t < 3_600_000_000_000 => write!(fmt, "{:.3}mins", t as f64 / 6e10),
            t => write!(fmt, "{:.3}hrs", t as f64 / 3.6e12),
        }
    }
}

pub fn server_name(name: &str) -> Result<ServerName, Error> {
    ServerName::try_from(name).map_err(|_| Error::InvalidServerName(name.to_owned()))
}
