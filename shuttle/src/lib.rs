//! HTTP/2 upgrade layer of an intercepting proxy.
//!
//! Requests to be forwarded are sent over h2 whenever the destination negotiates it through
//! ALPN, sharing one session per client session and destination. Everything else goes back to
//! the HTTP/1.x path of the caller.

pub mod cache;
pub mod config;
pub mod key;
pub mod opt;
pub mod request;
pub mod server;
pub mod session;
pub mod upgrade;
pub mod utils;

pub use alpn_tunnel::{BoxedIo, Destination, ProxyKind, ProxyOptions};

pub use crate::config::Config;
pub use crate::key::{DestKey, SessionKey};
pub use crate::request::{Fallback, FailFlag, ForwardRequest, ResponseSink, UpstreamResponse};
pub use crate::server::{serve, Inbound, RequestListener, ServerOptions, TlsServer};
pub use crate::session::SessionHandle;
pub use crate::upgrade::{KeyState, Upgrader};
