use thiserror::Error;

use std::io;
use std::time::Duration;

use crate::utils::DurationExt;

/// Error raised while establishing a transport to an upstream
#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[source] io::Error),
    #[error("tls handshake failed: {0}")]
    Tls(#[source] rustls::Error),
    #[error("invalid server name: {0}")]
    InvalidServerName(String),
    #[error("tunneling socket could not be established, statusCode={status}")]
    Tunnel { status: u16 },
    #[error("tunneling socket could not be established: {0}")]
    TunnelBroken(&'static str),
    #[error("connect timed out after {}", .0.autofmt())]
    TimedOut(Duration),
}

impl Error {
    /// Structured error code in the style of the surrounding proxy
    ///
    /// TLS-class errors are prefixed with `ERR_TLS_` or `ERR_SSL_`.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(e) => match e.kind() {
                io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
                io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof => "ECONNRESET",
                io::ErrorKind::TimedOut => "ETIMEDOUT",
                io::ErrorKind::NotFound => "ENOTFOUND",
                io::ErrorKind::BrokenPipe => "EPIPE",
                _ => "EIO",
            },
            Error::Tls(rustls::Error::InvalidCertificate(_)) => "ERR_TLS_CERT",
            Error::Tls(rustls::Error::AlertReceived(_)) => "ERR_SSL_ALERT_RECEIVED",
            Error::Tls(_) => "ERR_TLS_HANDSHAKE",
            Error::InvalidServerName(_) => "ERR_TLS_INVALID_SERVERNAME",
            Error::Tunnel { .. } | Error::TunnelBroken(_) => "ECONNRESET",
            Error::TimedOut(_) => "ETIMEDOUT",
        }
    }

    /// Whether the error is evidence that the upstream cannot negotiate as asked, rather than a
    /// transient network condition
    pub fn is_tls(&self) -> bool {
        let code = self.code();
        code.starts_with("ERR_TLS_") || code.starts_with("ERR_SSL_")
    }
}

impl From<io::Error> for Error {
    /// tokio-rustls reports protocol failures as `InvalidData` wrapping a `rustls::Error`.
    fn from(err: io::Error) -> Self {
        if err
            .get_ref()
            .map_or(false, |inner| inner.is::<rustls::Error>())
        {
            let kind = err.kind();
            match err.into_inner().map(|inner| inner.downcast::<rustls::Error>()) {
                Some(Ok(tls)) => Error::Tls(*tls),
                Some(Err(inner)) => Error::Io(io::Error::new(kind, inner)),
                None => Error::Io(kind.into()),
            }
        } else {
            Error::Io(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    use std::io;
    use std::time::Duration;

    #[test]
    fn tls_errors_are_recognized_through_io() {
        let wrapped = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::General("bad record".into()),
        );
        let err = Error::from(wrapped);
        assert!(matches!(err, Error::Tls(_)));
        assert_eq!(err.code(), "ERR_TLS_HANDSHAKE");
        assert!(err.is_tls());
    }

    #[test]
    fn transient_errors_are_not_tls() {
        let refused = Error::from(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(refused.code(), "ECONNREFUSED");
        assert!(!refused.is_tls());

        let tunnel = Error::Tunnel { status: 403 };
        assert_eq!(tunnel.code(), "ECONNRESET");
        assert!(!tunnel.is_tls());
        assert_eq!(
            tunnel.to_string(),
            "tunneling socket could not be established, statusCode=403"
        );

        assert!(!Error::TimedOut(Duration::from_secs(1)).is_tls());
    }
}
