//! HTTP/2 endpoints for forwarding plain requests, built upon [h2](https://docs.rs/h2/).
//!
//! The client side opens one stream per forwarded request on a shared connection. The server
//! side accepts streams and hands out request heads together with their bodies.
//!
//! Server push is never enabled.

use thiserror::Error;

pub mod client;
pub mod server;

mod stream;
mod utils;

pub use crate::client::{strip_connection_headers, InFlightStream};
pub use crate::stream::{send_body, RecvBody};
pub use crate::utils::h2_to_io_error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("h2 layer error")]
    H2Error(#[from] h2::Error),
}
