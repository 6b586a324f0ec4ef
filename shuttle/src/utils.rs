pub use alpn_tunnel::{DurationAutoFormatter, DurationExt};

/// Strip scheme and authority off an absolute-form URL, leaving path and query.
///
/// Origin-form URLs are returned as is. `None` if an absolute URL carries no path.
pub fn url_to_relative(mut url: &str) -> Option<&str> {
    if url.starts_with('/') {
        return Some(url);
    }
    if let Some(i) = url.find("//") {
        url = &url[i + 2..];
    }
    url.find(|c| c == '/' || c == '?')
        .map(|i| &url[i..])
}
