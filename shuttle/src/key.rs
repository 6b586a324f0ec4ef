use alpn_tunnel::{Destination, ProxyKind};

use std::fmt;

/// Identity of a destination together with the path taken to reach it
///
/// A session negotiated over one path is never reused over another, so every field of the
/// proxy route takes part in the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestKey {
    pub servername: String,
    pub host: String,
    pub port: u16,
    pub proxy: Option<ProxyKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyKey {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub target: String,
}

/// Scope of a multiplexed session: one inbound client connection towards one destination
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub session: u64,
    pub dest: DestKey,
}

impl DestKey {
    pub fn derive(dest: &Destination) -> Self {
        DestKey {
            servername: dest.sni().to_owned(),
            host: dest.host.clone(),
            port: dest.port(),
            proxy: dest.proxy.as_ref().map(|proxy| ProxyKey {
                kind: proxy.kind,
                host: proxy.host.clone(),
                port: proxy.port,
                target: proxy.target.clone(),
            }),
        }
    }
}

impl SessionKey {
    pub fn new(session: u64, dest: DestKey) -> Self {
        SessionKey { session, dest }
    }
}

impl fmt::Display for DestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.servername, self.host, self.port)?;
        if let Some(ref proxy) = self.proxy {
            write!(
                f,
                "/{}:{}:{}:{}",
                proxy.kind, proxy.host, proxy.port, proxy.target
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.session, self.dest)
    }
}
