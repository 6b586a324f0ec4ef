//! Transports to upstreams with TLS and ALPN negotiated, either dialed directly or tunneled
//! through a forward proxy.

mod client;
mod common;
mod error;
mod proxy;
mod utils;

pub use crate::client::{Establish, Establisher};
pub use crate::common::{
    BoxedIo, Destination, Io, Negotiated, ProxyKind, ProxyOptions, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_TLS_PORT, H2, SUPPORTED_PROTOCOLS,
};
pub use crate::error::Error;
pub use crate::proxy::{connect_tunnel, tunnel};
pub use crate::utils::{DurationAutoFormatter, DurationExt, NoCertificateVerification};
