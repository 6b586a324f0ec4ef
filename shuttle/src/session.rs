use h2mux::client::{Connection, Control};
use h2mux::send_body;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::key::SessionKey;
use crate::request::{ForwardRequest, ResponseSink, UpstreamResponse};
use crate::utils::DurationExt;

/// Live h2 connection shared by the requests of one client session towards one destination
#[derive(Clone)]
pub struct SessionHandle {
    key: SessionKey,
    generation: u64,
    control: Control,
    token: CancellationToken,
}

impl SessionHandle {
    /// Start driving `connection` in a task and return the handle to open streams on it.
    ///
    /// `on_close` runs once after the connection ends, for whatever reason.
    pub(crate) fn spawn<IO>(
        key: SessionKey,
        generation: u64,
        control: Control,
        connection: Connection<IO>,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = SessionHandle {
            key: key.clone(),
            generation,
            control,
            token: token.clone(),
        };
        tokio::spawn(async move {
            let t = Instant::now();
            tokio::select! {
                r = connection => match r {
                    Ok(()) => debug!(session = %key, "session closed after {}", t.elapsed().autofmt()),
                    Err(error) => debug!(
                        session = %key,
                        %error,
                        "session terminated after {}",
                        t.elapsed().autofmt()
                    ),
                },
                _ = token.cancelled() => debug!(
                    session = %key,
                    "session torn down after {}",
                    t.elapsed().autofmt()
                ),
            }
            // the connection, and the socket with it, is dropped by now
            token.cancel();
            on_close();
        });
        handle
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Close the connection. Repeated calls are no-ops.
    pub fn teardown(&self) {
        if !self.token.is_cancelled() {
            trace!(session = %self.key, "tearing down session");
            self.token.cancel();
        }
    }

    /// Open a stream for `request` and hand the response over to `sink` once it arrives.
    ///
    /// Returns as soon as the stream is open. A request already marked failed is skipped. A
    /// failure to open the stream is fatal to the whole session, while any later error only
    /// fails this one request.
    pub async fn dispatch(&self, request: ForwardRequest, sink: Box<dyn ResponseSink>) {
        if request.failed.is_failed() {
            trace!(session = %self.key, url = %request.url, "skipping failed request");
            return;
        }
        let failed = request.failed.clone();
        let (method, url) = (request.method.clone(), request.url.clone());
        let (head, body) = match request.into_h2() {
            Ok(r) => r,
            Err(error) => {
                warn!(session = %self.key, %url, %error, "failed to translate request");
                failed.fail();
                return;
            }
        };

        let mut control = self.control.clone();
        let mut stream = match control.open_stream(head, body.is_none()).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(session = %self.key, %url, %error, "failed to open stream");
                failed.fail();
                self.teardown();
                return;
            }
        };
        debug!(session = %self.key, %method, %url, "dispatched over h2");

        if let (Some(mut send_stream), Some(body)) = (stream.take_send_stream(), body) {
            let key = self.key.clone();
            tokio::spawn(async move {
                match send_body(&mut send_stream, body).await {
                    Ok(n) => trace!(session = %key, sent = n, "request body sent"),
                    Err(error) => debug!(session = %key, %error, "failed to send request body"),
                }
            });
        }

        let key = self.key.clone();
        tokio::spawn(async move {
            let t = Instant::now();
            match stream.response().await {
                Ok((head, body)) => {
                    debug!(
                        session = %key,
                        %url,
                        status = head.status.as_u16(),
                        "response received after {}",
                        t.elapsed().autofmt()
                    );
                    sink.respond(UpstreamResponse::new(head, body));
                }
                Err(error) => {
                    debug!(session = %key, %url, %error, "stream failed");
                    failed.fail();
                }
            }
        });
    }
}
