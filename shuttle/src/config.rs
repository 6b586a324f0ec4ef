use std::time::Duration;

use alpn_tunnel::DEFAULT_CONNECT_TIMEOUT;

/// Time within which a destination known not to speak h2 is not probed again
pub const NEGATIVE_TTL: Duration = Duration::from_secs(36);
/// Maximum number of destinations remembered as not speaking h2
pub const NEGATIVE_CAPACITY: usize = 2560;

#[derive(Debug, Clone)]
pub struct Config {
    /// Whether h2 is available at all; everything takes the fallback otherwise
    pub enable_h2: bool,
    pub connect_timeout: Duration,
    pub negative_ttl: Duration,
    pub negative_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enable_h2: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            negative_ttl: NEGATIVE_TTL,
            negative_capacity: NEGATIVE_CAPACITY,
        }
    }
}
