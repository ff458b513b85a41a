//! Socket URL construction
//!
//! Derives the WebSocket URL from the page origin (upgrading the scheme and
//! swapping the web-server port for the API port) or from an explicit base URL.

use url::Url;

use super::{ClientError, ClientResult};
use crate::config::EndpointConfig;

/// Query parameter carrying the token
pub const TOKEN_PARAM: &str = "token";

const REDACTED: &str = "REDACTED";

impl EndpointConfig {
    /// Build the socket URL carrying `token`
    ///
    /// A `base_url` path is kept as a mount prefix; an origin's page path is
    /// replaced.
    pub fn socket_url(&self, token: &str) -> ClientResult<Url> {
        let (mut url, prefix) = match &self.base_url {
            Some(base) => {
                let url = Url::parse(base)?;
                let prefix = url.path().trim_end_matches('/').to_string();
                (url, prefix)
            }
            None => {
                let mut origin = Url::parse(&self.origin)?;
                if origin.port() == Some(self.web_port) {
                    set_port(&mut origin, Some(self.api_port))?;
                }
                (origin, String::new())
            }
        };

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(ClientError::UnsupportedScheme(other.to_string())),
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::UnsupportedScheme(scheme.to_string()))?;

        url.set_path(&format!("{}/{}", prefix, self.path.trim_start_matches('/')));
        url.set_fragment(None);
        url.query_pairs_mut().clear().append_pair(TOKEN_PARAM, token);
        Ok(url)
    }
}

fn set_port(url: &mut Url, port: Option<u16>) -> ClientResult<()> {
    url.set_port(port)
        .map_err(|_| ClientError::UnsupportedScheme(url.scheme().to_string()))
}

/// Render a URL for logs with the token value hidden
pub fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == TOKEN_PARAM { REDACTED.to_string() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    if pairs.is_empty() {
        return shown.to_string();
    }
    shown.query_pairs_mut().clear().extend_pairs(pairs);
    shown.to_string()
}
