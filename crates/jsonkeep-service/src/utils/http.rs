use std::time::Duration;

use crate::config::Config;

/// Timeouts applied to every upstream fetch.
#[derive(Copy, Clone, Debug)]
pub struct FetchTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one fetch, including the body.
    pub fetch: Duration,
}

impl FetchTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            fetch: config.fetch_timeout,
        }
    }
}

impl Default for FetchTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(2),
            fetch: Duration::from_secs(30),
        }
    }
}

/// Creates the [`reqwest::Client`] used to talk to the upstream.
pub fn create_client(timeouts: &FetchTimeouts) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.fetch)
        .pool_idle_timeout(Duration::from_secs(30))
        .user_agent(concat!("jsonkeep/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Returns the media type of a `Content-Type` header value, without any parameters.
pub fn media_type(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_type() {
        assert_eq!(media_type("application/json"), "application/json");
        assert_eq!(
            media_type("application/json; charset=utf-8"),
            "application/json"
        );
        assert_eq!(media_type(" text/html ;q=1"), "text/html");
        assert_eq!(media_type(""), "");

        // case is kept, callers compare ignoring it
        assert_eq!(
            media_type("Application/JSON; Charset=UTF-8"),
            "Application/JSON"
        );
    }
}
