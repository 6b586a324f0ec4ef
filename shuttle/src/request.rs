//! Shapes of requests entering the upgrade layer and of responses leaving it.

use h2mux::{strip_connection_headers, RecvBody};
use http::header::HOST;
use http::{HeaderMap, Method, Request, StatusCode, Uri, Version};
use tokio::io::AsyncRead;
use tokio::sync::oneshot;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alpn_tunnel::{BoxedIo, Destination, DEFAULT_TLS_PORT};

use crate::utils::url_to_relative;

pub type Body = Box<dyn AsyncRead + Send + Unpin>;

/// Hand-back to the HTTP/1.x forwarding path, possibly with an already negotiated socket
pub type Fallback = Box<dyn FnOnce(ForwardRequest, Box<dyn ResponseSink>, Option<BoxedIo>) + Send>;

/// Marker shared with the pipeline telling whether a request has been resolved as failed
#[derive(Debug, Clone, Default)]
pub struct FailFlag(Arc<AtomicBool>);

impl FailFlag {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn fail(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_failed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Parsed inbound request a client wants forwarded
pub struct ForwardRequest {
    /// Identifier of the inbound client connection, scoping session reuse
    pub session_id: u64,
    pub method: Method,
    /// Request target in origin form or absolute form
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Body>,
    /// Whether the pipeline asks for h2 towards the destination
    pub use_h2: bool,
    pub destination: Option<Destination>,
    pub failed: FailFlag,
}

impl ForwardRequest {
    pub fn new(session_id: u64, method: Method, url: impl Into<String>) -> Self {
        ForwardRequest {
            session_id,
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            use_h2: true,
            destination: None,
            failed: FailFlag::new(),
        }
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_body(mut self, body: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.body = Some(Box::new(body));
        self
    }

    /// `Host` header if any, else the destination with its port unless it is the default one
    fn authority(&self) -> Option<String> {
        if let Some(host) = self.headers.get(HOST).and_then(|v| v.to_str().ok()) {
            return Some(host.to_owned());
        }
        self.destination.as_ref().map(|dest| match dest.port() {
            DEFAULT_TLS_PORT => dest.host.clone(),
            port => format!("{}:{}", dest.host, port),
        })
    }

    fn path(&self) -> String {
        match url_to_relative(&self.url) {
            Some(path) if path.starts_with('/') => path.to_owned(),
            Some(query) => format!("/{}", query),
            None => "/".to_owned(),
        }
    }

    /// Split into an h2 request head, with connection-specific headers dropped, and the body.
    pub(crate) fn into_h2(mut self) -> Result<(Request<()>, Option<Body>), http::Error> {
        let authority = self.authority().unwrap_or_default();
        let path = self.path();
        let uri = Uri::builder()
            .scheme("https")
            .authority(authority.as_str())
            .path_and_query(path.as_str())
            .build()?;
        strip_connection_headers(&mut self.headers);
        let mut request = Request::builder()
            .method(self.method)
            .uri(uri)
            .body(())?;
        *request.headers_mut() = self.headers;
        Ok((request, self.body))
    }
}

impl fmt::Debug for ForwardRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardRequest")
            .field("session_id", &self.session_id)
            .field("method", &self.method)
            .field("url", &self.url)
            .field("use_h2", &self.use_h2)
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

/// Response received over h2, presented as if it came over HTTP/1.1
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: RecvBody,
}

impl UpstreamResponse {
    pub(crate) fn new(head: http::response::Parts, body: RecvBody) -> Self {
        // pseudo-headers never reach the header map, h2 decodes them into the head
        UpstreamResponse {
            status: head.status,
            version: Version::HTTP_11,
            headers: head.headers,
            body,
        }
    }
}

/// Receiver of the response to a request dispatched over h2
///
/// A sink dropped without a response means the stream failed.
pub trait ResponseSink: Send + 'static {
    fn respond(self: Box<Self>, response: UpstreamResponse);
}

impl ResponseSink for oneshot::Sender<UpstreamResponse> {
    fn respond(self: Box<Self>, response: UpstreamResponse) {
        let _ = self.send(response);
    }
}

impl ResponseSink for Box<dyn FnOnce(UpstreamResponse) + Send> {
    fn respond(self: Box<Self>, response: UpstreamResponse) {
        (*self)(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::header::{CONNECTION, HeaderValue};

    #[test]
    fn translate_origin_form() {
        let mut req = ForwardRequest::new(1, Method::GET, "/")
            .with_destination(Destination::new("example.com"));
        req.headers
            .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        req.headers
            .insert("keep-alive", HeaderValue::from_static("timeout=5"));
        req.headers
            .insert("accept", HeaderValue::from_static("text/html"));

        let (request, body) = req.into_h2().unwrap();
        assert!(body.is_none());
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.uri(), "https://example.com/");
        assert_eq!(request.headers().len(), 1);
        assert_eq!(request.headers()["accept"], "text/html");
    }

    #[test]
    fn translate_absolute_form_with_host() {
        let mut req = ForwardRequest::new(1, Method::POST, "http://example.com:8443/a?b=c")
            .with_destination(Destination::new("example.com").with_port(8443))
            .with_body(&b"payload"[..]);
        let (request, body) = ForwardRequest::new(1, Method::GET, "https://example.com?x")
            .with_destination(Destination::new("example.com").with_port(8443))
            .into_h2()
            .unwrap();
        assert!(body.is_none());
        assert_eq!(request.uri(), "https://example.com:8443/?x");

        req.headers
            .insert(HOST, HeaderValue::from_static("www.example.com"));
        let (request, body) = req.into_h2().unwrap();
        assert!(body.is_some());
        assert_eq!(request.uri().authority().unwrap(), "www.example.com");
        assert_eq!(request.uri().path_and_query().unwrap(), "/a?b=c");
        assert!(request.headers().get(HOST).is_none());
    }

    #[test]
    fn no_authority_is_an_error() {
        assert!(ForwardRequest::new(1, Method::GET, "/").into_h2().is_err());
    }

    #[test]
    fn fail_flag_is_shared() {
        let req = ForwardRequest::new(1, Method::GET, "/");
        let flag = req.failed.clone();
        assert!(!req.failed.is_failed());
        flag.fail();
        assert!(req.failed.is_failed());
    }
}
