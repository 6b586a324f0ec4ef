use http::Uri;
use structopt::clap::AppSettings::{ColoredHelp, DeriveDisplayOrder};
use structopt::StructOpt;

use std::time::Duration;

use alpn_tunnel::{Destination, ProxyKind, ProxyOptions};

use crate::config::Config;

#[derive(Debug, Clone, StructOpt)]
#[structopt(
    name = "h2-shuttle",
    about = "Forward requests to upstreams over h2 whenever they speak it",
    global_settings(&[ColoredHelp, DeriveDisplayOrder])
)]
pub struct Opt {
    /// Never speak h2 to upstreams, falling back for every request
    #[structopt(long = "disable-h2")]
    pub disable_h2: bool,

    /// Time limit of each connect phase, in seconds
    #[structopt(long = "connect-timeout", default_value = "30", name = "secs")]
    pub connect_timeout: u64,

    /// Time within which an upstream found not to speak h2 is not probed again, in seconds
    #[structopt(long = "negative-ttl", default_value = "36", name = "ttl")]
    pub negative_ttl: u64,

    /// Forward proxy to reach upstreams through, as SCHEME://[USER:PASS@]HOST:PORT with SCHEME
    /// being one of http, https and socks
    #[structopt(long = "proxy", parse(try_from_str = parse_proxy))]
    pub proxy: Option<ProxySpec>,

    /// Number of concurrent requests sent for each URL
    #[structopt(short = "n", long = "repeat", default_value = "1")]
    pub repeat: usize,

    /// Identifier of the client session the requests are sent on behalf of
    #[structopt(long = "session", default_value = "1")]
    pub session: u64,

    /// URLs to request
    #[structopt(name = "URL", required = true)]
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySpec {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub auth: Option<String>,
}

impl Opt {
    pub fn config(&self) -> Config {
        Config {
            enable_h2: !self.disable_h2,
            connect_timeout: Duration::from_secs(self.connect_timeout),
            negative_ttl: Duration::from_secs(self.negative_ttl),
            ..Default::default()
        }
    }

    /// Resolve a URL into where it is headed, through the configured proxy if any.
    pub fn destination(&self, url: &str) -> Result<Destination, &'static str> {
        let uri: Uri = url.parse().map_err(|_| "invalid url")?;
        match uri.scheme_str() {
            None | Some("https") => {}
            Some(_) => return Err("only https urls can be upgraded"),
        }
        let host = uri.host().ok_or("url without host")?;
        let mut dest = Destination::new(host);
        if let Some(port) = uri.port_u16() {
            dest = dest.with_port(port);
        }
        if let Some(ref proxy) = self.proxy {
            let mut options = ProxyOptions::new(proxy.kind, &proxy.host, proxy.port, dest.target());
            options.auth = proxy.auth.clone();
            dest = dest.with_proxy(options);
        }
        Ok(dest)
    }
}

fn parse_proxy(s: &str) -> Result<ProxySpec, &'static str> {
    let (scheme, rest) = s
        .trim()
        .split_once("://")
        .ok_or("expected format: SCHEME://[USER:PASS@]HOST:PORT")?;
    let kind = scheme.parse::<ProxyKind>()?;
    let (auth, addr) = match rest.rsplit_once('@') {
        Some((auth, addr)) => (Some(auth.to_owned()), addr),
        None => (None, rest),
    };
    let (host, port) = addr
        .trim_end_matches('/')
        .rsplit_once(':')
        .ok_or("proxy port missing")?;
    let port = port.parse::<u16>().map_err(|_| "proxy port not integer")?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err("proxy host missing");
    }
    Ok(ProxySpec {
        kind,
        host: host.to_owned(),
        port,
        auth,
    })
}
